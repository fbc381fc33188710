use proptest::prelude::*;
use tracing_log_targets::syslog::{escape_sd_value, format_rfc5424, priority, structured_data};
use tracing_log_targets::target::{target_config_changed, FilterLevel};
use tracing_log_targets::{Level, LogRecord, TargetConfig};

fn any_level() -> impl Strategy<Value = Level> {
    prop_oneof![
        Just(Level::Debug),
        Just(Level::Info),
        Just(Level::Warn),
        Just(Level::Error),
        Just(Level::Fatal),
        Just(Level::Panic),
    ]
}

fn any_filter() -> impl Strategy<Value = FilterLevel> {
    prop_oneof![
        Just(FilterLevel::Debug),
        Just(FilterLevel::Info),
        Just(FilterLevel::Warn),
        Just(FilterLevel::Error),
    ]
}

/// Undo `escape_sd_value`, failing on any unescaped special character.
fn unescape(escaped: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '"' | ']' => return None,
            other => out.push(other),
        }
    }
    Some(out)
}

proptest! {
    #[test]
    fn sd_escaping_is_reversible(value in ".*") {
        let escaped = escape_sd_value(&value);
        prop_assert_eq!(unescape(&escaped), Some(value));
    }

    #[test]
    fn filter_admits_exactly_the_levels_at_or_above_it(filter in any_filter(), level in any_level()) {
        prop_assert_eq!(filter.admits(level), level >= filter.min_level());
        if level >= Level::Error {
            prop_assert!(filter.admits(level));
        }
    }

    #[test]
    fn priority_stays_in_daemon_facility(level in any_level()) {
        let pri = priority(level);
        prop_assert_eq!(pri / 8, 3);
        prop_assert!(pri % 8 <= 7);
    }

    #[test]
    fn rfc5424_frame_is_one_line(
        message in "[^\n]*",
        key in "[a-z]{1,8}",
        value in "[^\n]*",
    ) {
        let record = LogRecord::new(Level::Info, message).with_field(key, value);
        let frame = format_rfc5424(&record, "objectstore", "host", 1);
        prop_assert!(frame.ends_with('\n'));
        prop_assert_eq!(frame.matches('\n').count(), 1);
        let sd = structured_data("objectstore", &record);
        prop_assert!(frame.contains(&sd));
    }

    #[test]
    fn filter_level_never_forces_reconnect(a in any_filter(), b in any_filter()) {
        let old = TargetConfig::syslog("siem", "10.0.0.5", 514).with_filter_level(a);
        let new = old.clone().with_filter_level(b).with_enabled(false);
        prop_assert!(!target_config_changed(&old, &new));
    }
}
