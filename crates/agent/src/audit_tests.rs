// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use yare::parameterized;

use super::*;

#[parameterized(
    comms_connect = { "comms.open", false },
    comms_nested = { "comms.user.disconnect", false },
    flow_get = { "flows.get", false },
    settings_get = { "settings.get", false },
    auth_login_attempt = { "auth.login", false },
    auth_bare = { "auth", false },
    auth_log = { "auth.log", true },
    auth_log_session = { "auth.log.session", true },
    flows_set = { "flows.set", true },
    nodes_install = { "nodes.install", true },
    crashed = { "crashed", true },
)]
fn filters_audit_events(event: &str, forwarded: bool) {
    assert_eq!(should_forward(event), forwarded, "event {event:?}");
}

#[test]
fn get_suffix_must_be_a_segment_tail() {
    // "budget" ends in "get" but not ".get".
    assert!(should_forward("budget"));
    assert!(!should_forward("nodes.get"));
}
