use chrono::{DateTime, Duration, Utc};

// Bracket rounds are spaced exactly 30 minutes apart starting at prime time.
const ROUND_INTERVAL_MINUTES: i64 = 30;

/// Computes the planned start instant of every bracket round.
///
/// The effective starting round is `reported_round` only once the bracket
/// has begun (`now > prime`); before prime time upstream echoes the previous
/// day's round number, so it is forced back to 1. Upstream also omits the
/// round number entirely on freshly opened fronts, which defaults to 1.
///
/// When the territory has a defending owner, one extra instant is appended
/// for the owner's final match. The length of the returned sequence is the
/// "max rounds" value used for round titles.
pub fn planned_times(
    prime: DateTime<Utc>,
    participant_count: usize,
    reported_round: Option<i32>,
    now: DateTime<Utc>,
    has_owner: bool,
) -> Vec<DateTime<Utc>> {
    let round_number = if now > prime {
        reported_round.unwrap_or(1)
    } else {
        1
    };

    let total_rounds = if participant_count > 0 {
        round_number + rounds_for(participant_count) - 1
    } else {
        round_number - 1
    };

    // A degenerate bracket can compute to zero or negative rounds; that means
    // no scheduled rounds, not a panic.
    let total_rounds = total_rounds.max(0);

    let interval = Duration::minutes(ROUND_INTERVAL_MINUTES);
    let mut times: Vec<DateTime<Utc>> = (0..total_rounds)
        .map(|i| prime + interval * i)
        .collect();

    if has_owner {
        times.push(prime + interval * total_rounds);
    }

    times
}

/// ceil(log2(count)): the number of elimination rounds a field of `count`
/// entrants needs.
fn rounds_for(participant_count: usize) -> i32 {
    (participant_count as f64).log2().ceil() as i32
}

/// Human-readable title for a round: the last planned round is the final,
/// everything before it is a 1/2^k stage.
pub fn round_title(round: i32, max_rounds: usize) -> String {
    if round <= 0 || max_rounds == 0 {
        return String::new();
    }

    if round as usize >= max_rounds {
        "Final".to_string()
    } else {
        let k = (max_rounds - round as usize) as u32;
        format!("Round 1 / {}", 1u64 << k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn it_schedules_one_round_per_elimination_stage() {
        let prime = at("2016-11-27T18:15:00Z");
        let now = at("2016-11-27T18:20:00Z");

        let times = planned_times(prime, 4, Some(1), now, false);
        assert_eq!(
            times,
            vec![prime, at("2016-11-27T18:45:00Z")]
        );
    }

    #[test]
    fn it_appends_the_owner_final_slot() {
        let prime = at("2016-11-27T18:15:00Z");
        let now = at("2016-11-27T18:20:00Z");

        let times = planned_times(prime, 4, Some(1), now, true);
        assert_eq!(times.len(), 3);
        assert_eq!(times[2], at("2016-11-27T19:15:00Z"));
    }

    #[test]
    fn it_forces_round_one_before_prime_time() {
        let prime = at("2016-11-27T18:15:00Z");
        let now = at("2016-11-27T12:00:00Z");

        // Upstream still reports yesterday's round number at this point.
        let times = planned_times(prime, 4, Some(6), now, false);
        assert_eq!(times.len(), 2);
        assert_eq!(times[0], prime);
    }

    #[test]
    fn it_trusts_the_reported_round_after_prime_time() {
        let prime = at("2016-11-27T18:15:00Z");
        let now = at("2016-11-27T19:00:00Z");

        let times = planned_times(prime, 2, Some(3), now, false);
        // Rounds 1 and 2 already happened; one stage remains for 2 clans.
        assert_eq!(times.len(), 3);
    }

    #[test]
    fn it_defaults_a_missing_round_number_to_one() {
        let prime = at("2016-11-27T18:15:00Z");
        let now = at("2016-11-27T19:00:00Z");

        let times = planned_times(prime, 4, None, now, false);
        assert_eq!(times.len(), 2);
    }

    #[test]
    fn it_yields_no_rounds_for_an_empty_field() {
        let prime = at("2016-11-27T18:15:00Z");
        let now = at("2016-11-27T12:00:00Z");

        assert!(planned_times(prime, 0, None, now, false).is_empty());
        // An owner with no challengers still holds the single slot.
        assert_eq!(planned_times(prime, 0, None, now, true), vec![prime]);
    }

    #[test]
    fn it_titles_the_last_round_as_the_final() {
        assert_eq!(round_title(3, 3), "Final");
        assert_eq!(round_title(2, 3), "Round 1 / 2");
        assert_eq!(round_title(1, 3), "Round 1 / 4");
    }
}
