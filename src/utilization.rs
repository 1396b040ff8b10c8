//! Utilization targets.
//!
//! A [`UtilizationKey`] names one stream of occupancy observations: a
//! facility, the class of spots, and what those spots are used for.
//! Predictors are enabled per key, and new observations dirty every
//! predictor tracking the same key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a physical parking facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FacilityId(i64);

impl FacilityId {
    /// Wraps a raw facility identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for FacilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for FacilityId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Class of parking spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapacityType {
    /// Regular car spot
    Car,
    /// Accessible spot
    Disabled,
    /// Spot with a charging point
    ElectricCar,
    /// Motorcycle spot
    Motorcycle,
    /// Open bicycle rack
    Bicycle,
    /// Locked bicycle storage
    BicycleSecureSpace,
}

impl CapacityType {
    /// All capacity types, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Car,
        Self::Disabled,
        Self::ElectricCar,
        Self::Motorcycle,
        Self::Bicycle,
        Self::BicycleSecureSpace,
    ];

    /// Canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Car => "CAR",
            Self::Disabled => "DISABLED",
            Self::ElectricCar => "ELECTRIC_CAR",
            Self::Motorcycle => "MOTORCYCLE",
            Self::Bicycle => "BICYCLE",
            Self::BicycleSecureSpace => "BICYCLE_SECURE_SPACE",
        }
    }
}

impl fmt::Display for CapacityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Purpose category of a parking spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Usage {
    /// Free parking for public transport passengers
    ParkAndRide,
    /// Parking that requires a valid travel card
    HslTravelCard,
    /// Paid commercial parking
    Commercial,
}

impl Usage {
    /// All usages, in declaration order.
    pub const ALL: [Self; 3] = [Self::ParkAndRide, Self::HslTravelCard, Self::Commercial];

    /// Canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParkAndRide => "PARK_AND_RIDE",
            Self::HslTravelCard => "HSL_TRAVEL_CARD",
            Self::Commercial => "COMMERCIAL",
        }
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a prediction target.
///
/// Equality and hashing are structural over all three fields, so two keys
/// differing only in usage are distinct targets.
///
/// # Examples
///
/// ```
/// use parkandride_predictor::{CapacityType, FacilityId, Usage, UtilizationKey};
///
/// let key = UtilizationKey::new(FacilityId::new(7), CapacityType::Car, Usage::ParkAndRide);
/// assert_eq!(key.to_string(), "7/CAR/PARK_AND_RIDE");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UtilizationKey {
    /// The facility being observed.
    pub facility_id: FacilityId,
    /// Spot class being observed.
    pub capacity_type: CapacityType,
    /// Spot purpose being observed.
    pub usage: Usage,
}

impl UtilizationKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(facility_id: FacilityId, capacity_type: CapacityType, usage: Usage) -> Self {
        Self {
            facility_id,
            capacity_type,
            usage,
        }
    }
}

impl fmt::Display for UtilizationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.facility_id, self.capacity_type, self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn key(facility: i64, capacity_type: CapacityType, usage: Usage) -> UtilizationKey {
        UtilizationKey::new(FacilityId::new(facility), capacity_type, usage)
    }

    #[test]
    fn keys_differing_in_one_field_are_distinct() {
        let base = key(1, CapacityType::Car, Usage::ParkAndRide);
        assert_eq!(base, key(1, CapacityType::Car, Usage::ParkAndRide));
        assert_ne!(base, key(2, CapacityType::Car, Usage::ParkAndRide));
        assert_ne!(base, key(1, CapacityType::ElectricCar, Usage::ParkAndRide));
        assert_ne!(base, key(1, CapacityType::Car, Usage::Commercial));

        let set: HashSet<_> = [
            base,
            key(1, CapacityType::Car, Usage::ParkAndRide),
            key(1, CapacityType::Car, Usage::Commercial),
        ]
        .into_iter()
        .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn enum_names_match_serialized_form() {
        for capacity_type in CapacityType::ALL {
            let json = serde_json::to_string(&capacity_type).unwrap();
            assert_eq!(json, format!("\"{}\"", capacity_type.as_str()));
        }
        for usage in Usage::ALL {
            let json = serde_json::to_string(&usage).unwrap();
            assert_eq!(json, format!("\"{}\"", usage.as_str()));
        }
    }

    #[test]
    fn key_display() {
        let k = key(12, CapacityType::BicycleSecureSpace, Usage::HslTravelCard);
        assert_eq!(k.to_string(), "12/BICYCLE_SECURE_SPACE/HSL_TRAVEL_CARD");
    }
}
