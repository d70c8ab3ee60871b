/********************************************************************************
 * Copyright (c) 2026 Contributors to the mqtt-queue project
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

/*!
MQTT topic-filter matching.

Used by the local loopback broker to route published messages and by the
connection manager to decide whether a subscription's topic is an exact
(wildcard-free) filter.
*/

/// Checks whether a topic filter contains a wildcard level (`+` or `#`).
///
/// A filter without wildcards only ever matches the identical topic string.
///
/// # Examples
///
/// ```rust
/// use mqtt_queue::topic;
///
/// assert!(topic::contains_wildcard("sensors/+/temperature"));
/// assert!(topic::contains_wildcard("sensors/#"));
/// assert!(!topic::contains_wildcard("sensors/kitchen/temperature"));
/// ```
pub fn contains_wildcard(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}

/// Checks whether a topic matches a topic filter.
///
/// Implements the MQTT wildcard semantics: `+` matches exactly one topic
/// level, `#` matches zero or more remaining levels and is only treated as a
/// wildcard when it is the last level of the filter.
///
/// # Examples
///
/// ```rust
/// use mqtt_queue::topic;
///
/// assert!(topic::matches("sensors/+/temperature", "sensors/kitchen/temperature"));
/// assert!(topic::matches("sensors/#", "sensors"));
/// assert!(!topic::matches("sensors/+", "sensors/kitchen/temperature"));
/// ```
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (None, None) => return true,
            (None, Some(_)) => return false,
            (Some(filter_level), topic_level) => {
                // "#" matches all remaining levels, including none, but only
                // as the last level of the filter
                if filter_level == "#" && filter_levels.clone().next().is_none() {
                    return true;
                }
                match topic_level {
                    None => return false,
                    Some(topic_level) => {
                        if filter_level != "+" && filter_level != topic_level {
                            return false;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("devices/telemetry", "devices/telemetry", true; "exact match")]
    #[test_case("devices/telemetry", "devices/commands", false; "different level")]
    #[test_case("devices/telemetry", "devices", false; "filter longer than topic")]
    #[test_case("devices", "devices/telemetry", false; "topic longer than filter")]
    #[test_case("devices/+", "devices/telemetry", true; "single level wildcard")]
    #[test_case("devices/+/state", "devices/d1/state", true; "wildcard in the middle")]
    #[test_case("devices/+", "devices/d1/state", false; "plus matches one level only")]
    #[test_case("devices/#", "devices/d1/state", true; "hash matches deep levels")]
    #[test_case("devices/#", "devices", true; "hash matches parent level")]
    #[test_case("#", "devices/d1/state", true; "hash matches everything")]
    #[test_case("devices/#/state", "devices/d1/state", false; "hash not at end is literal")]
    #[test_case("+/+", "devices/d1", true; "multiple wildcards")]
    fn test_matches(filter: &str, topic: &str, expected: bool) {
        assert_eq!(matches(filter, topic), expected);
    }

    #[test_case("devices/telemetry", false; "plain topic")]
    #[test_case("devices/+", true; "single level")]
    #[test_case("devices/#", true; "multi level")]
    #[test_case("devices/a+b", false; "plus inside a level is literal")]
    fn test_contains_wildcard(filter: &str, expected: bool) {
        assert_eq!(contains_wildcard(filter), expected);
    }
}
