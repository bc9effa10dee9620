//! Zone memberships of one link
//!
//! A link forwards in a zone only after it joined that zone's FDB and got a
//! port id there. Memberships are reconciled against announced or local
//! zone sets by diffing, joining the missing zones and quitting the rest.

use crate::dataplane::{FdbRegistry, Port, PortId, ZoneFdb};
use crate::protocol::ZoneId;
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Joined {
    fdb: Arc<ZoneFdb>,
    port: PortId,
}

/// Zone id to (FDB, port id) for one link
#[derive(Debug)]
pub struct Memberships {
    joined: RwLock<BTreeMap<ZoneId, Joined>>,
    counted: bool,
}

impl Memberships {
    /// `counted` memberships hold their zone alive in dynamic mode.
    pub fn new(counted: bool) -> Self {
        Self {
            joined: RwLock::new(BTreeMap::new()),
            counted,
        }
    }

    pub fn is_counted(&self) -> bool {
        self.counted
    }

    fn joined(&self) -> RwLockReadGuard<'_, BTreeMap<ZoneId, Joined>> {
        self.joined.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn joined_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<ZoneId, Joined>> {
        self.joined.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join `zone`, creating its FDB if needed. Joining twice is a no-op.
    pub fn join(&self, fdbs: &FdbRegistry, zone: ZoneId, port: Arc<dyn Port>) -> Result<()> {
        let mut joined = self.joined_mut();
        if joined.contains_key(&zone) {
            return Ok(());
        }
        let fdb = fdbs.get_or_create(zone);
        let id = fdb.join_port(port, self.counted)?;
        debug!(zone, port = id, "joined zone");
        joined.insert(zone, Joined { fdb, port: id });
        Ok(())
    }

    /// Join each zone, logging the ones that refuse. Returns how many joined.
    pub fn join_many(&self, fdbs: &FdbRegistry, zones: &[ZoneId], port: &Arc<dyn Port>) -> usize {
        let mut count = 0;
        for &zone in zones {
            match self.join(fdbs, zone, Arc::clone(port)) {
                Ok(()) => count += 1,
                Err(e) => warn!(zone, error = %e, "cannot join zone"),
            }
        }
        count
    }

    /// Leave `zone`. In dynamic mode the zone is removed once no counted
    /// port holds it.
    pub fn quit(&self, fdbs: &FdbRegistry, zone: ZoneId, dynamic: bool) -> bool {
        let Some(left) = self.joined_mut().remove(&zone) else {
            return false;
        };
        left.fdb.release_port(left.port, self.counted);
        debug!(zone, port = left.port, "left zone");
        if dynamic {
            fdbs.try_remove(zone);
        }
        true
    }

    pub fn quit_many(&self, fdbs: &FdbRegistry, zones: &[ZoneId], dynamic: bool) -> usize {
        zones
            .iter()
            .filter(|&&zone| self.quit(fdbs, zone, dynamic))
            .count()
    }

    pub fn quit_all(&self, fdbs: &FdbRegistry, dynamic: bool) {
        let zones = self.ids();
        self.quit_many(fdbs, &zones, dynamic);
    }

    /// Make the joined set equal `wanted`. Returns whether anything changed.
    pub fn sync(
        &self,
        fdbs: &FdbRegistry,
        wanted: &[ZoneId],
        port: &Arc<dyn Port>,
        dynamic: bool,
    ) -> bool {
        let (join, quit) = self.diff(wanted);
        let quitted = self.quit_many(fdbs, &quit, dynamic);
        let joined = self.join_many(fdbs, &join, port);
        quitted + joined > 0
    }

    pub fn get(&self, zone: ZoneId) -> Option<(Arc<ZoneFdb>, PortId)> {
        self.joined()
            .get(&zone)
            .map(|j| (Arc::clone(&j.fdb), j.port))
    }

    pub fn contains(&self, zone: ZoneId) -> bool {
        self.joined().contains_key(&zone)
    }

    /// Joined zone ids, ascending
    pub fn ids(&self) -> Vec<ZoneId> {
        self.joined().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.joined().len()
    }

    pub fn is_empty(&self) -> bool {
        self.joined().is_empty()
    }

    /// Zones to join and zones to quit to reach `wanted`
    pub fn diff(&self, wanted: &[ZoneId]) -> (Vec<ZoneId>, Vec<ZoneId>) {
        let wanted: BTreeSet<ZoneId> = wanted.iter().copied().collect();
        let joined = self.joined();
        let join = wanted
            .iter()
            .filter(|zone| !joined.contains_key(zone))
            .copied()
            .collect();
        let quit = joined
            .keys()
            .filter(|zone| !wanted.contains(zone))
            .copied()
            .collect();
        (join, quit)
    }
}
