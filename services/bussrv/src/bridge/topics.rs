//! MQTT topic scheme
//!
//! `{namespace}/{category}/{protocol}/{address}`. This module is the
//! only place these strings are built or taken apart; everything else
//! passes topics around opaquely.

use domus_knx::GroupAddress;

pub const PROTOCOL: &str = "knx";

/// Retained device state: `{ns}/state/knx/{address}`
pub fn state(namespace: &str, address: GroupAddress) -> String {
    format!("{}/state/{}/{}", namespace, PROTOCOL, address.to_topic())
}

/// Command subscription filter: `{ns}/command/knx/#`
pub fn command_filter(namespace: &str) -> String {
    format!("{}/command/{}/#", namespace, PROTOCOL)
}

/// Command acknowledgements: `{ns}/ack/knx/{device_id}`
pub fn ack(namespace: &str, device_id: &str) -> String {
    format!("{}/ack/{}/{}", namespace, PROTOCOL, device_id)
}

/// Retained bridge health: `{ns}/health/knx`
pub fn health(namespace: &str) -> String {
    format!("{}/health/{}", namespace, PROTOCOL)
}

/// Retained device discovery: `{ns}/discovery/knx/{device_id}`
pub fn discovery(namespace: &str, device_id: &str) -> String {
    format!("{}/discovery/{}/{}", namespace, PROTOCOL, device_id)
}

/// Extract the device id from a received command topic
///
/// Returns `None` for topics outside the command tree. The device id is
/// everything after the `{ns}/command/knx/` prefix, so ids containing
/// `/` survive unharmed.
pub fn parse_command(namespace: &str, topic: &str) -> Option<String> {
    let prefix = format!("{}/command/{}/", namespace, PROTOCOL);
    topic
        .strip_prefix(&prefix)
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_topic_escapes_address() {
        let ga = GroupAddress::new(1, 2, 3).unwrap();
        assert_eq!(state("domus", ga), "domus/state/knx/1%2F2%2F3");
    }

    #[test]
    fn test_command_topic_round_trip() {
        assert_eq!(command_filter("domus"), "domus/command/knx/#");
        assert_eq!(
            parse_command("domus", "domus/command/knx/lamp-1"),
            Some("lamp-1".to_string())
        );
        assert_eq!(parse_command("domus", "domus/state/knx/lamp-1"), None);
        assert_eq!(parse_command("domus", "domus/command/knx/"), None);
    }

    #[test]
    fn test_fixed_topics() {
        assert_eq!(health("home"), "home/health/knx");
        assert_eq!(ack("home", "lamp-1"), "home/ack/knx/lamp-1");
        assert_eq!(discovery("home", "lamp-1"), "home/discovery/knx/lamp-1");
    }
}
