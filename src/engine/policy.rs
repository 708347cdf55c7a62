use std::str::FromStr;

use crate::model::{BookingRequest, Car};

use super::EngineError;

/// Client-supplied driver age constraint: `"min"` or `"min-max"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeGroup {
    Min(i32),
    Range(i32, i32),
}

impl FromStr for AgeGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<i32>()
                .map_err(|_| format!("age group {s:?} must be \"min\" or \"min-max\""))
        };
        match s.split_once('-') {
            None => Ok(AgeGroup::Min(parse(s)?)),
            Some((min, max)) => {
                let (min, max) = (parse(min)?, parse(max)?);
                if min >= max {
                    return Err(format!("age group {s:?} must have min below max"));
                }
                Ok(AgeGroup::Range(min, max))
            }
        }
    }
}

impl AgeGroup {
    /// Whether a car with the given minimum driver age may be booked by
    /// this group. Bounds are strict on both forms.
    pub fn admits_booking(&self, car_min_age: i32) -> bool {
        match *self {
            AgeGroup::Min(min) => min > car_min_age,
            AgeGroup::Range(min, max) => min < car_min_age && car_min_age < max,
        }
    }

    /// Search filter form: `min_age >= min`, or `min <= min_age <= max`.
    pub fn admits_search(&self, car_min_age: i32) -> bool {
        match *self {
            AgeGroup::Min(min) => car_min_age >= min,
            AgeGroup::Range(min, max) => (min..=max).contains(&car_min_age),
        }
    }
}

/// Run every policy check against the car and report all failures at once.
pub(crate) fn check_booking_policy(req: &BookingRequest, car: &Car) -> Result<(), EngineError> {
    let mut reasons = Vec::new();

    if !car.locations.iter().any(|l| *l == req.location) {
        reasons.push(format!(
            "location {:?} is not served by car {}",
            req.location, car.id
        ));
    }
    if req.car_group != car.car_group {
        reasons.push(format!(
            "car group {} does not match car group {}",
            req.car_group, car.car_group
        ));
    }
    if let Some(raw) = req.age_group.as_deref().filter(|s| !s.trim().is_empty()) {
        match raw.parse::<AgeGroup>() {
            Ok(group) if group.admits_booking(car.min_age) => {}
            Ok(_) => reasons.push(format!(
                "age group {raw:?} does not fit minimal driver age {}",
                car.min_age
            )),
            Err(reason) => reasons.push(reason),
        }
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(reasons))
    }
}
