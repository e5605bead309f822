// THEORY:
// A `Zone` is a static, camera-scoped, named region or line with a semantic role. The
// role, not the name, decides which events a zone produces: queue corridors, parking
// slots and dining areas track dwell; work areas track staff attendance; the sink area
// feeds the hygiene rule; the gate line counts directional crossings.

use serde::{Deserialize, Serialize};

use crate::config::ZoneConfig;
use crate::core_modules::geometry::{CrossingDirection, LineSegment, Point, Polygon};
use crate::core_modules::observation::{EntityClass, Millis, ZoneId};
use crate::error::{Result, VisionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneRole {
    QueueCorridor,
    GateLine,
    ParkingSlot,
    SinkArea,
    WorkArea,
    DiningArea,
}

impl ZoneRole {
    pub fn is_line(&self) -> bool {
        matches!(self, ZoneRole::GateLine)
    }

    /// Zones whose visits produce DWELL_START / DWELL_END pairs.
    pub fn tracks_dwell(&self) -> bool {
        matches!(
            self,
            ZoneRole::QueueCorridor | ZoneRole::ParkingSlot | ZoneRole::DiningArea
        )
    }

    /// Zones whose visits produce ATTENDANCE_START / ATTENDANCE_END pairs.
    pub fn tracks_attendance(&self) -> bool {
        matches!(self, ZoneRole::WorkArea)
    }

    /// Parking slots only care about vehicles; every other zone only about people.
    pub fn admits(&self, class: EntityClass) -> bool {
        match self {
            ZoneRole::ParkingSlot => class == EntityClass::Vehicle,
            _ => class == EntityClass::Person,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ZoneShape {
    Area(Polygon),
    Line(LineSegment),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub id: ZoneId,
    pub role: ZoneRole,
    pub shape: ZoneShape,
    /// Time inside before DWELL_START fires.
    pub min_dwell_ms: Millis,
}

impl Zone {
    pub fn from_config(config: &ZoneConfig) -> Result<Self> {
        let shape = if config.role.is_line() {
            config.geometry.as_line().map(ZoneShape::Line)
        } else {
            config.geometry.as_polygon().map(ZoneShape::Area)
        }
        .ok_or_else(|| {
            VisionError::Config(format!("zone '{}' geometry does not match its role", config.id))
        })?;

        Ok(Self {
            id: config.id.clone(),
            role: config.role,
            shape,
            min_dwell_ms: (config.min_dwell_secs * 1000.0).round() as Millis,
        })
    }

    /// Area containment. Lines contain nothing.
    pub fn contains(&self, point: &Point) -> bool {
        match &self.shape {
            ZoneShape::Area(polygon) => polygon.contains(point),
            ZoneShape::Line(_) => false,
        }
    }

    /// Directional crossing of a line zone. Areas are never crossed.
    pub fn crossing(&self, previous: &Point, current: &Point) -> Option<CrossingDirection> {
        match &self.shape {
            ZoneShape::Line(line) => line.crossing(previous, current),
            ZoneShape::Area(_) => None,
        }
    }
}

/// Builds the zone list for one camera.
pub fn zones_from_config(configs: &[ZoneConfig]) -> Result<Vec<Zone>> {
    configs.iter().map(Zone::from_config).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneGeometry;

    fn queue_config() -> ZoneConfig {
        ZoneConfig {
            id: ZoneId::from("queue_corridor"),
            role: ZoneRole::QueueCorridor,
            geometry: ZoneGeometry::Polygon {
                points: vec![
                    Point::new(0.0, 0.0),
                    Point::new(100.0, 0.0),
                    Point::new(100.0, 50.0),
                    Point::new(0.0, 50.0),
                ],
            },
            min_dwell_secs: 2.5,
        }
    }

    #[test]
    fn builds_area_zone_with_dwell_delay() {
        let zone = Zone::from_config(&queue_config()).expect("valid zone");
        assert_eq!(zone.min_dwell_ms, 2500);
        assert!(zone.contains(&Point::new(50.0, 25.0)));
        assert_eq!(zone.crossing(&Point::new(-10.0, 25.0), &Point::new(50.0, 25.0)), None);
    }

    #[test]
    fn mismatched_geometry_is_a_config_error() {
        let mut config = queue_config();
        config.role = ZoneRole::GateLine;
        assert!(matches!(Zone::from_config(&config), Err(VisionError::Config(_))));
    }

    #[test]
    fn roles_admit_their_class() {
        assert!(ZoneRole::ParkingSlot.admits(EntityClass::Vehicle));
        assert!(!ZoneRole::ParkingSlot.admits(EntityClass::Person));
        assert!(ZoneRole::SinkArea.admits(EntityClass::Person));
        assert!(ZoneRole::QueueCorridor.tracks_dwell());
        assert!(!ZoneRole::SinkArea.tracks_dwell());
        assert!(ZoneRole::WorkArea.tracks_attendance());
    }
}
