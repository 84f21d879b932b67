//! End-to-end tests of the controller main loop with recording collaborators.

mod common;

use common::{
    counter, harness, harness_with_store, reply, wait_for, Harness, Mappings, SwitchFake,
    DATAPATH_ID, SID, TABLE,
};
use enforcement_statsd::codec::RuleMatch;
use enforcement_statsd::collaborators::RuleNumMapper;
use enforcement_statsd::constants::DEFAULT_FLOW_COOKIE;
use enforcement_statsd::protocol::{FlowModCommand, FlowStat, MatchField, StatsReply};
use enforcement_statsd::{
    ControllerEvent, Direction, EnforcementConfig, FlowAction, FlowInstaller, PolicyRule,
    RuleFlowRequest, StatsClass, UsageRecord,
};
use pretty_assertions::assert_eq;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn ue_ip() -> IpAddr {
    "192.168.128.10".parse().unwrap()
}

fn measured(rule_num: u32, version: u64, direction: Direction) -> RuleMatch {
    RuleMatch::new(SID, Some(ue_ip()), rule_num, version, direction, 0)
        .with_class(StatsClass::Measured)
}

async fn started(config: EnforcementConfig) -> Harness {
    let mut h = harness(config);
    h.controller.initialize_on_connect().await.unwrap();
    assert!(h.controller.handle_event(ControllerEvent::InitFinished).await);
    h.switch.clear();
    h
}

#[tokio::test]
async fn test_connect_installs_default_flow() {
    let mut h = harness(EnforcementConfig::default());
    h.controller.initialize_on_connect().await.unwrap();

    let mods = h.switch.flow_mods();
    assert_eq!(mods.len(), 2);
    assert_eq!(mods[0].command, FlowModCommand::Delete);
    assert!(mods[0].flow_match.is_empty());
    assert_eq!(mods[1].command, FlowModCommand::Add);
    assert_eq!(mods[1].cookie, DEFAULT_FLOW_COOKIE);
    assert_eq!(mods[1].table_id, TABLE);
}

#[tokio::test]
async fn test_multipart_reply_reported_after_last_batch() {
    let h = started(EnforcementConfig::default()).await;
    let rule = h.rules.get_or_create_rule_num("rule1").await.unwrap();
    let handle = h.controller.handle();
    let events = handle.events();
    let upstream = h.upstream.clone();
    tokio::spawn(h.controller.run());

    events
        .send(ControllerEvent::StatsReply(reply(
            true,
            vec![counter(measured(rule, 1, Direction::In), 1514, 1)],
        )))
        .unwrap();
    events
        .send(ControllerEvent::StatsReply(reply(true, vec![])))
        .unwrap();
    // the loop is serialized: once this answers, both batches were handled
    handle.policy_usage().await.unwrap();
    assert!(upstream.tables.lock().is_empty());

    events
        .send(ControllerEvent::StatsReply(reply(
            false,
            vec![counter(measured(rule, 1, Direction::Out), 1500, 1)],
        )))
        .unwrap();
    assert!(wait_for(|| upstream.tables.lock().len() == 1).await);

    let table = upstream.tables.lock()[0].clone();
    assert_eq!(
        table.records,
        vec![UsageRecord {
            rule_id: "rule1".to_string(),
            sid: SID.to_string(),
            rule_version: 1,
            ue_ipv4: Some("192.168.128.10".parse().unwrap()),
            ue_ipv6: None,
            teid: None,
            bytes_rx: 1500,
            bytes_tx: 1500,
            dropped_rx: 0,
            dropped_tx: 0,
        }]
    );
    assert!(!table.update_rule_versions);
    assert_eq!(handle.policy_usage().await.unwrap(), table);
    handle.shutdown();
}

#[tokio::test]
async fn test_acknowledged_report_reclaims_superseded_version() {
    let h = started(EnforcementConfig::default()).await;
    let switch = h.switch.clone();
    let versions = h.versions.clone();

    let rule = PolicyRule::new("rule1", &[FlowAction::Permit]);
    let install = |version| RuleFlowRequest {
        sid: SID,
        ip: Some(ue_ip()),
        rule: &rule,
        version,
        shard_id: 0,
        teid: 0,
    };
    let flows = h.controller.flows().clone();
    assert!(flows.install_rule_flows(&install(3)).await.is_success());
    assert!(flows.install_rule_flows(&install(4)).await.is_success());
    versions.set("rule1", 4);
    let rule_num = h.rules.get_or_create_rule_num("rule1").await.unwrap();
    switch.clear();

    let handle = h.controller.handle();
    tokio::spawn(h.controller.run());
    handle
        .events()
        .send(ControllerEvent::StatsReply(reply(
            false,
            vec![
                counter(measured(rule_num, 3, Direction::Out), 100, 1),
                counter(measured(rule_num, 4, Direction::Out), 200, 2),
            ],
        )))
        .unwrap();

    assert!(wait_for(|| switch.flow_mods().len() == 2).await);
    let deletes = switch.flow_mods();
    for m in &deletes {
        assert_eq!(m.command, FlowModCommand::Delete);
        assert_eq!(m.flow_match.get_num(MatchField::RuleVersion), Some(3));
    }
    assert_eq!(
        deletes
            .iter()
            .map(|m| m.flow_match.get_num(MatchField::Direction))
            .collect::<Vec<_>>(),
        vec![
            Some(Direction::In.reg_value()),
            Some(Direction::Out.reg_value())
        ]
    );
    handle.shutdown();
}

#[tokio::test]
async fn test_rejected_report_skips_reclamation() {
    let h = started(EnforcementConfig::default()).await;
    h.upstream.reject.store(true, Ordering::SeqCst);
    h.versions.set("rule1", 9);
    let rule_num = h.rules.get_or_create_rule_num("rule1").await.unwrap();
    let switch = h.switch.clone();
    let upstream = h.upstream.clone();

    let handle = h.controller.handle();
    tokio::spawn(h.controller.run());
    handle
        .events()
        .send(ControllerEvent::StatsReply(reply(
            false,
            vec![counter(measured(rule_num, 3, Direction::Out), 100, 1)],
        )))
        .unwrap();

    assert!(wait_for(|| upstream.tables.lock().len() == 1).await);
    // completion has been handled once the loop answers a later request
    tokio::task::yield_now().await;
    handle.policy_usage().await.unwrap();
    assert!(switch.flow_mods().is_empty());
    handle.shutdown();
}

#[tokio::test]
async fn test_default_flow_only_still_reports_empty_table() {
    let mut h = started(EnforcementConfig::default()).await;
    let default_flow = FlowStat {
        table_id: TABLE,
        cookie: DEFAULT_FLOW_COOKIE,
        priority: 0,
        byte_count: 2048,
        packet_count: 2,
        flow_match: Default::default(),
    };

    h.controller
        .handle_event(ControllerEvent::StatsReply(reply(false, vec![default_flow])))
        .await;
    assert_eq!(h.controller.unmatched_bytes(), 2048);
    assert!(h.controller.policy_usage().is_empty());

    let upstream = h.upstream.clone();
    assert!(wait_for(|| upstream.tables.lock().len() == 1).await);
    assert!(upstream.tables.lock()[0].is_empty());
}

#[tokio::test]
async fn test_reply_without_entries_is_not_reported() {
    let mut h = started(EnforcementConfig::default()).await;
    h.controller
        .handle_event(ControllerEvent::StatsReply(reply(false, vec![])))
        .await;
    tokio::task::yield_now().await;
    assert!(h.upstream.tables.lock().is_empty());
}

#[tokio::test]
async fn test_foreign_datapath_reply_ignored() {
    let mut h = started(EnforcementConfig::default()).await;
    let rule_num = h.rules.get_or_create_rule_num("rule1").await.unwrap();
    let foreign = StatsReply {
        datapath_id: DATAPATH_ID + 1,
        xid: 1,
        more: false,
        body: vec![counter(measured(rule_num, 1, Direction::Out), 10, 1)],
    };

    h.controller
        .handle_event(ControllerEvent::StatsReply(foreign))
        .await;
    tokio::task::yield_now().await;
    assert!(h.upstream.tables.lock().is_empty());
    assert!(h.controller.policy_usage().is_empty());
}

#[tokio::test]
async fn test_ng_session_state_reported() {
    let mut config = EnforcementConfig::default();
    config.enable5g_features = true;
    let mut h = started(config).await;
    let rule_num = h.rules.get_or_create_rule_num("rule1").await.unwrap();

    let with_teid = RuleMatch::new(SID, Some(ue_ip()), rule_num, 2, Direction::Out, 500)
        .with_class(StatsClass::Measured);
    h.controller
        .handle_event(ControllerEvent::StatsReply(reply(
            false,
            vec![counter(with_teid, 10, 1)],
        )))
        .await;

    let upstream = h.upstream.clone();
    assert!(wait_for(|| upstream.sessions.lock().len() == 1).await);
    let sessions = upstream.sessions.lock()[0].clone();
    assert_eq!(sessions[&500].subscriber_id, SID);
    assert_eq!(sessions[&500].session_version, 2);
}

#[tokio::test]
async fn test_disconnect_clears_state() {
    let mut h = started(EnforcementConfig::default()).await;
    let rule_num = h.rules.get_or_create_rule_num("rule1").await.unwrap();
    h.controller
        .handle_event(ControllerEvent::StatsReply(reply(
            false,
            vec![counter(measured(rule_num, 1, Direction::Out), 10, 1)],
        )))
        .await;
    assert_eq!(h.controller.policy_usage().len(), 1);

    h.controller
        .handle_event(ControllerEvent::DatapathDisconnected)
        .await;
    assert!(h.controller.policy_usage().is_empty());
    assert_eq!(h.controller.unmatched_bytes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_reports_before_init() {
    let mut h = harness(EnforcementConfig::default());
    h.controller.initialize_on_connect().await.unwrap();
    let upstream = h.upstream.clone();
    let handle = h.controller.handle();
    let _scheduler = h.controller.spawn_scheduler();
    tokio::spawn(h.controller.run());

    tokio::time::sleep(std::time::Duration::from_secs(7)).await;
    let tables = upstream.tables.lock().clone();
    assert_eq!(tables.len(), 3);
    assert!(tables.iter().all(|t| t.is_empty()));

    handle.finish_init();
    tokio::time::sleep(std::time::Duration::from_secs(7)).await;
    assert_eq!(upstream.tables.lock().len(), 3);
    handle.shutdown();
}

fn install<'a>(rule: &'a PolicyRule, version: u64) -> RuleFlowRequest<'a> {
    RuleFlowRequest {
        sid: SID,
        ip: Some(ue_ip()),
        rule,
        version,
        shard_id: 0,
        teid: 0,
    }
}

#[tokio::test]
async fn test_restart_reclaims_with_persisted_rule_numbers() {
    let mut config = EnforcementConfig::default();
    config.clean_restart = false;
    let store = Arc::new(Mappings::default());

    // first run installs two versions of the rule, then the daemon restarts
    let before = harness_with_store(config.clone(), store.clone()).await;
    let rule = PolicyRule::new("rule1", &[FlowAction::Permit]);
    let flows = before.controller.flows().clone();
    assert!(flows.install_rule_flows(&install(&rule, 3)).await.is_success());
    assert!(flows.install_rule_flows(&install(&rule, 4)).await.is_success());
    assert_eq!(before.rules.rule_id(1).unwrap(), "rule1");
    drop(before);

    let mut h = harness_with_store(config, store).await;
    assert_eq!(h.rules.rule_id(1).unwrap(), "rule1");
    h.versions.set("rule1", 4);
    h.controller.initialize_on_connect().await.unwrap();
    assert!(h.controller.handle_event(ControllerEvent::InitFinished).await);
    h.switch.clear();

    let switch = h.switch.clone();
    let upstream = h.upstream.clone();
    let handle = h.controller.handle();
    tokio::spawn(h.controller.run());
    handle
        .events()
        .send(ControllerEvent::StatsReply(reply(
            false,
            vec![counter(measured(1, 3, Direction::Out), 5000, 5)],
        )))
        .unwrap();

    assert!(wait_for(|| upstream.tables.lock().len() == 1).await);
    let records = upstream.tables.lock()[0].records.clone();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].rule_id, "rule1");
    assert_eq!(records[0].rule_version, 3);
    assert_eq!(records[0].bytes_tx, 5000);

    assert!(wait_for(|| switch.flow_mods().len() == 2).await);
    for m in switch.flow_mods() {
        assert_eq!(m.command, FlowModCommand::Delete);
        assert_eq!(m.flow_match.get_num(MatchField::RuleNum), Some(1));
        assert_eq!(m.flow_match.get_num(MatchField::RuleVersion), Some(3));
    }
    handle.shutdown();
}

#[tokio::test]
async fn test_get_stats_answers_caller_only() {
    let h = started(EnforcementConfig::default()).await;
    let rule_num = h.rules.get_or_create_rule_num("rule1").await.unwrap();
    h.versions.set("rule1", 2);
    let switch = h.switch.clone();
    let upstream = h.upstream.clone();
    let handle = h.controller.handle();
    tokio::spawn(h.controller.run());

    let query = tokio::spawn({
        let handle = handle.clone();
        async move { handle.get_stats(0, 0).await }
    });
    assert!(wait_for(|| switch.stats_request_xid().is_some()).await);
    let xid = switch.stats_request_xid().unwrap();

    let events = handle.events();
    for (more, stat) in [
        (true, counter(measured(rule_num, 1, Direction::In), 514, 1)),
        (false, counter(measured(rule_num, 1, Direction::Out), 700, 7)),
    ] {
        events
            .send(ControllerEvent::StatsReply(StatsReply {
                datapath_id: DATAPATH_ID,
                xid,
                more,
                body: vec![stat],
            }))
            .unwrap();
    }

    let table = query.await.unwrap().unwrap();
    assert_eq!(table.records.len(), 1);
    assert_eq!(table.records[0].rule_version, 1);
    assert_eq!(table.records[0].bytes_rx, 500);
    assert_eq!(table.records[0].bytes_tx, 700);

    // version 1 is superseded by 2
    assert!(wait_for(|| switch.flow_mods().len() == 2).await);
    assert!(switch
        .flow_mods()
        .iter()
        .all(|m| m.flow_match.get_num(MatchField::RuleVersion) == Some(1)));
    assert!(upstream.tables.lock().is_empty());
    assert!(handle.policy_usage().await.unwrap().is_empty());
    handle.shutdown();
}

#[tokio::test]
async fn test_reconnect_rebinds_and_reinstalls_default_flow() {
    let mut h = started(EnforcementConfig::default()).await;
    let rule_num = h.rules.get_or_create_rule_num("rule1").await.unwrap();

    h.slot.clear();
    h.controller
        .handle_event(ControllerEvent::DatapathDisconnected)
        .await;
    let replacement = Arc::new(SwitchFake::new(DATAPATH_ID + 1, h.hub.clone()));
    h.slot.set(replacement.clone());
    h.controller
        .handle_event(ControllerEvent::DatapathConnected)
        .await;

    let mods = replacement.flow_mods();
    assert_eq!(mods.last().map(|m| m.cookie), Some(DEFAULT_FLOW_COOKIE));
    assert_eq!(mods.last().map(|m| m.command), Some(FlowModCommand::Add));

    // replies are now taken from the new switch only
    let from_new = StatsReply {
        datapath_id: DATAPATH_ID + 1,
        xid: 9,
        more: false,
        body: vec![counter(measured(rule_num, 1, Direction::Out), 10, 1)],
    };
    h.controller
        .handle_event(ControllerEvent::StatsReply(from_new))
        .await;
    assert_eq!(h.controller.policy_usage().len(), 1);
}
