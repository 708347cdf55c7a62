use crate::limits::MAX_IN_CLAUSE_VALUES;
use crate::model::{CarState, Span};

use super::conflict::{find_overlap, parse_window};
use super::policy::AgeGroup;
use super::EngineError;

/// Raw search parameters as they arrive from a client. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub locations: Vec<String>,
    pub age: Option<String>,
    pub car_group: Option<i32>,
}

/// Validated predicates over a car and its bookings. All present predicates
/// must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    /// Car must be free for the whole window. `None` when no date was given.
    pub window: Option<Span>,
    /// Car must serve at least one of these. Empty = any location.
    pub locations: Vec<String>,
    pub age: Option<AgeGroup>,
    pub car_group: Option<i32>,
}

impl SearchFilter {
    pub fn build(query: SearchQuery) -> Result<Self, EngineError> {
        let mut reasons = Vec::new();

        let from = query.from.as_deref().filter(|s| !s.trim().is_empty());
        let to = query.to.as_deref().filter(|s| !s.trim().is_empty());
        let window = if from.is_none() && to.is_none() {
            None
        } else {
            Some(parse_window(from, to)?)
        };

        let locations: Vec<String> = query
            .locations
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if locations.len() > MAX_IN_CLAUSE_VALUES {
            return Err(EngineError::LimitExceeded("too many locations in search"));
        }

        let age = match query.age.as_deref().filter(|s| !s.trim().is_empty()) {
            None => None,
            Some(raw) => match raw.parse::<AgeGroup>() {
                Ok(g) => Some(g),
                Err(reason) => {
                    reasons.push(reason);
                    None
                }
            },
        };

        if !reasons.is_empty() {
            return Err(EngineError::Validation(reasons));
        }
        Ok(Self {
            window,
            locations,
            age,
            car_group: query.car_group,
        })
    }

    pub fn matches(&self, cs: &CarState) -> bool {
        let car = &cs.car;
        if !self.locations.is_empty() && !self.locations.iter().any(|l| car.locations.contains(l)) {
            return false;
        }
        if let Some(age) = &self.age
            && !age.admits_search(car.min_age)
        {
            return false;
        }
        if let Some(group) = self.car_group
            && group != car.car_group
        {
            return false;
        }
        match &self.window {
            Some(window) => find_overlap(cs, window).is_none(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn state(locations: &[&str], min_age: i32, group: i32) -> CarState {
        CarState::new(Car {
            id: Ulid::new(),
            company: "Avis".into(),
            doors: 4,
            big_luggage: 1,
            small_luggage: 1,
            seats: 4,
            air_conditioner: false,
            min_age,
            price: 20,
            locations: locations.iter().map(|s| s.to_string()).collect(),
            car_group: group,
            description: "City car".into(),
        })
    }

    fn book(cs: &mut CarState, from: &str, to: &str) {
        cs.insert_booking(Booking {
            id: Ulid::new(),
            car_id: cs.car.id,
            span: Span::new(parse_timestamp(from).unwrap(), parse_timestamp(to).unwrap()),
            location: cs.car.locations[0].clone(),
            extras: vec![],
            discounts: vec![],
            details: String::new(),
        });
    }

    #[test]
    fn empty_query_matches_everything() {
        let f = SearchFilter::build(SearchQuery::default()).unwrap();
        assert_eq!(f.window, None);
        assert!(f.matches(&state(&["Haifa"], 21, 1)));
    }

    #[test]
    fn location_is_any_of() {
        let f = SearchFilter::build(SearchQuery {
            locations: vec!["Eilat".into(), " Haifa ".into()],
            ..Default::default()
        })
        .unwrap();
        assert!(f.matches(&state(&["Haifa", "Acre"], 21, 1)));
        assert!(!f.matches(&state(&["Tel Aviv"], 21, 1)));
    }

    #[test]
    fn age_and_group_predicates() {
        let f = SearchFilter::build(SearchQuery {
            age: Some("21-25".into()),
            car_group: Some(3),
            ..Default::default()
        })
        .unwrap();
        assert!(f.matches(&state(&["Haifa"], 25, 3)));
        assert!(!f.matches(&state(&["Haifa"], 26, 3)));
        assert!(!f.matches(&state(&["Haifa"], 22, 4)));

        let min_only = SearchFilter::build(SearchQuery {
            age: Some("30".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(min_only.matches(&state(&["Haifa"], 30, 1)));
        assert!(!min_only.matches(&state(&["Haifa"], 29, 1)));
    }

    #[test]
    fn booked_cars_are_excluded_from_window() {
        let mut cs = state(&["Haifa"], 21, 1);
        book(&mut cs, "2022-01-10T00:00:00Z", "2022-01-20T00:00:00Z");
        let during = SearchFilter::build(SearchQuery {
            from: Some("2022-01-15T00:00:00Z".into()),
            to: Some("2022-01-16T00:00:00Z".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(!during.matches(&cs));

        let after = SearchFilter::build(SearchQuery {
            from: Some("2022-01-20T00:00:00Z".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(after.matches(&cs));

        let until_start = SearchFilter::build(SearchQuery {
            to: Some("2022-01-10T00:00:00Z".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(until_start.matches(&cs));
    }

    #[test]
    fn invalid_inputs_rejected() {
        let bad_age = SearchFilter::build(SearchQuery {
            age: Some("old".into()),
            ..Default::default()
        });
        assert!(matches!(bad_age, Err(EngineError::Validation(_))));

        let reversed = SearchFilter::build(SearchQuery {
            from: Some("2022-02-01T00:00:00Z".into()),
            to: Some("2022-01-01T00:00:00Z".into()),
            ..Default::default()
        });
        assert!(matches!(reversed, Err(EngineError::Validation(_))));
    }
}
