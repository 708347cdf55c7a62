use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// First booking on the car overlapping `span`, if any.
///
/// Open sides of either interval are encoded as `Ms::MIN` / `Ms::MAX`, so an
/// open-ended booking conflicts with everything after its start.
pub fn find_overlap(cs: &CarState, span: &Span) -> Option<ulid::Ulid> {
    cs.overlapping(span)
        .find(|b| b.span.overlaps(span))
        .map(|b| b.id)
}

pub(crate) fn check_no_conflict(cs: &CarState, span: &Span) -> Result<(), EngineError> {
    match find_overlap(cs, span) {
        Some(booking_id) => Err(EngineError::Conflict {
            car_id: cs.car.id,
            booking_id,
        }),
        None => Ok(()),
    }
}

/// Parse a required `[from, to)` pair as sent by a booking request.
pub(crate) fn parse_booking_window(from: &str, to: &str) -> Result<Span, EngineError> {
    if from.trim().is_empty() || to.trim().is_empty() {
        return Err(EngineError::invalid("booking dates must be provided"));
    }
    parse_window(Some(from), Some(to))
}

/// Parse a query window; a missing side is unbounded.
pub fn parse_window(from: Option<&str>, to: Option<&str>) -> Result<Span, EngineError> {
    let from = from.map(parse_bound).transpose()?;
    let to = to.map(parse_bound).transpose()?;
    if let (Some(f), Some(t)) = (from, to)
        && f >= t
    {
        return Err(EngineError::invalid(
            "from date must be earlier than to date",
        ));
    }
    Ok(Span::bounded_by(from, to))
}

fn parse_bound(s: &str) -> Result<Ms, EngineError> {
    let ms = parse_timestamp(s).ok_or_else(|| {
        EngineError::invalid(format!(
            "malformed date {s:?}, expected YYYY-MM-DDTHH:MM:SSZ"
        ))
    })?;
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const D: Ms = 86_400_000;

    fn state_with(spans: &[Span]) -> CarState {
        let id = Ulid::new();
        let mut cs = CarState::new(Car {
            id,
            company: "Kia".into(),
            doors: 4,
            big_luggage: 1,
            small_luggage: 2,
            seats: 5,
            air_conditioner: true,
            min_age: 24,
            price: 50,
            locations: vec!["Haifa".into()],
            car_group: 2,
            description: "Brand new car".into(),
        });
        for span in spans {
            cs.insert_booking(Booking {
                id: Ulid::new(),
                car_id: id,
                span: *span,
                location: "Haifa".into(),
                extras: vec![],
                discounts: vec![],
                details: String::new(),
            });
        }
        cs
    }

    #[test]
    fn empty_car_has_no_overlap() {
        let cs = state_with(&[]);
        assert_eq!(find_overlap(&cs, &Span::new(0, D)), None);
    }

    #[test]
    fn contained_containing_and_partial_overlaps() {
        let cs = state_with(&[Span::new(10 * D, 20 * D)]);
        let existing = cs.bookings[0].id;
        for window in [
            Span::new(12 * D, 18 * D), // inside
            Span::new(5 * D, 25 * D),  // around
            Span::new(5 * D, 11 * D),  // tail overlaps head
            Span::new(19 * D, 30 * D), // head overlaps tail
            Span::new(10 * D, 20 * D), // identical
        ] {
            assert_eq!(find_overlap(&cs, &window), Some(existing), "{window:?}");
        }
    }

    #[test]
    fn touching_intervals_do_not_conflict() {
        let cs = state_with(&[Span::new(10 * D, 20 * D)]);
        assert_eq!(find_overlap(&cs, &Span::new(20 * D, 30 * D)), None);
        assert_eq!(find_overlap(&cs, &Span::new(0, 10 * D)), None);
    }

    #[test]
    fn open_ended_booking_blocks_everything_after_start() {
        let cs = state_with(&[Span::bounded_by(Some(10 * D), None)]);
        assert!(find_overlap(&cs, &Span::new(1000 * D, 1001 * D)).is_some());
        assert!(find_overlap(&cs, &Span::new(0, 10 * D)).is_none());
    }

    #[test]
    fn open_ended_query_sees_later_bookings() {
        let cs = state_with(&[Span::new(50 * D, 51 * D)]);
        assert!(find_overlap(&cs, &Span::bounded_by(Some(10 * D), None)).is_some());
        assert!(find_overlap(&cs, &Span::bounded_by(None, Some(50 * D))).is_none());
    }

    #[test]
    fn conflict_error_names_car_and_booking() {
        let cs = state_with(&[Span::new(0, D)]);
        match check_no_conflict(&cs, &Span::new(0, D)) {
            Err(EngineError::Conflict { car_id, booking_id }) => {
                assert_eq!(car_id, cs.car.id);
                assert_eq!(booking_id, cs.bookings[0].id);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn booking_window_requires_both_dates() {
        assert!(matches!(
            parse_booking_window("", "2022-01-16T15:13:30Z"),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            parse_booking_window("2022-01-15T15:13:30Z", "  "),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn window_order_enforced() {
        let same = parse_window(Some("2022-01-15T15:13:30Z"), Some("2022-01-15T15:13:30Z"));
        assert!(matches!(same, Err(EngineError::Validation(_))));
        let reversed = parse_window(Some("2022-01-16T00:00:00Z"), Some("2022-01-15T00:00:00Z"));
        assert!(matches!(reversed, Err(EngineError::Validation(_))));
    }

    #[test]
    fn window_with_missing_side_is_unbounded() {
        let span = parse_window(Some("2022-01-15T00:00:00Z"), None).unwrap();
        assert_eq!(span.end_bound(), None);
        assert!(span.start_bound().is_some());
        let all = parse_window(None, None).unwrap();
        assert_eq!(all, Span::new(Ms::MIN, Ms::MAX));
    }

    #[test]
    fn malformed_date_is_validation_error() {
        let err = parse_window(Some("15/01/2022"), None).unwrap_err();
        assert!(err.to_string().contains("malformed date"));
    }

    #[test]
    fn pre_epoch_date_exceeds_limits() {
        let err = parse_window(Some("1969-12-31T23:59:59Z"), None).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
    }
}
