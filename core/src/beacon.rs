//! Beacon roster and per-floor bundles.
//!
//! Beacon identifiers are matched exactly against the keys of the live signal snapshot. Ideally they are stable
//! hardware addresses; when those are not yet known the caller may supply a name-derived identifier instead, the
//! roster does not care which.
use std::collections::HashMap;
use std::fmt::{self, Display};

use anyhow::{Context, Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::graph::{Graph, NavGraph};
use crate::{BeaconId, Position, SignalSnapshot};

/// A beacon with a known position on a floor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub id: BeaconId,
    pub x: f64,
    pub y: f64,
}
impl Display for Beacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Beacon {} ({:.2}, {:.2})", self.id, self.x, self.y)
    }
}
impl Beacon {
    pub fn new(id: impl Into<BeaconId>, x: f64, y: f64) -> Beacon {
        Beacon {
            id: id.into(),
            x,
            y,
        }
    }
    pub fn position(&self) -> Position {
        Position::new(self.x, self.y)
    }
}

/// The known beacons of one floor, indexed by identifier.
#[derive(Clone, Debug, Default)]
pub struct BeaconRoster {
    beacons: Vec<Beacon>,
    index: HashMap<BeaconId, usize>,
}
impl BeaconRoster {
    /// Index a beacon list.
    ///
    /// Exact duplicates are collapsed. The same identifier at two different positions is rejected, as is any
    /// non-finite position.
    pub fn new(beacons: Vec<Beacon>) -> Result<BeaconRoster> {
        let mut roster = BeaconRoster::default();
        for beacon in beacons {
            if !beacon.x.is_finite() || !beacon.y.is_finite() {
                bail!("{} has a non-finite position", beacon.id);
            }
            match roster.index.get(&beacon.id) {
                Some(&i) if roster.beacons[i] == beacon => {
                    debug!("Ignoring repeated roster entry for {}", beacon.id);
                }
                Some(&i) => bail!(
                    "beacon '{}' listed at two positions: {} and {}",
                    beacon.id,
                    roster.beacons[i].position(),
                    beacon.position()
                ),
                None => {
                    roster.index.insert(beacon.id.clone(), roster.beacons.len());
                    roster.beacons.push(beacon);
                }
            }
        }
        Ok(roster)
    }
    pub fn get(&self, id: &str) -> Option<&Beacon> {
        self.index.get(id).map(|&i| &self.beacons[i])
    }
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }
    pub fn len(&self) -> usize {
        self.beacons.len()
    }
    pub fn is_empty(&self) -> bool {
        self.beacons.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &Beacon> {
        self.beacons.iter()
    }
    /// Snapshot readings whose beacon is on this roster, paired with the beacon
    pub fn matched<'a>(
        &'a self,
        snapshot: &'a SignalSnapshot,
    ) -> impl Iterator<Item = (&'a Beacon, f64)> + 'a {
        snapshot
            .iter()
            .filter_map(|(id, rssi)| self.get(id).map(|beacon| (beacon, rssi)))
    }
    /// Number of snapshot readings that belong to this roster
    pub fn count_matched(&self, snapshot: &SignalSnapshot) -> usize {
        snapshot.ids().filter(|id| self.contains(id)).count()
    }
}

/// Serializable description of one floor: its graph and beacon list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FloorData {
    pub id: String,
    pub graph: Graph,
    #[serde(default)]
    pub beacons: Vec<Beacon>,
}

/// A floor ready for localization: validated graph plus beacon roster.
#[derive(Clone, Debug)]
pub struct Floor {
    pub id: String,
    pub graph: NavGraph,
    pub roster: BeaconRoster,
}
impl Display for Floor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Floor {} ({}, {} beacons)",
            self.id,
            self.graph,
            self.roster.len()
        )
    }
}
impl TryFrom<FloorData> for Floor {
    type Error = anyhow::Error;
    fn try_from(data: FloorData) -> Result<Self> {
        let graph = NavGraph::new(data.graph).with_context(|| format!("floor '{}'", data.id))?;
        let roster =
            BeaconRoster::new(data.beacons).with_context(|| format!("floor '{}'", data.id))?;
        Ok(Floor {
            id: data.id,
            graph,
            roster,
        })
    }
}
impl Floor {
    pub fn new(id: impl Into<String>, graph: NavGraph, roster: BeaconRoster) -> Floor {
        Floor {
            id: id.into(),
            graph,
            roster,
        }
    }
}
