//! Auto-reply engine tests driven through the full inbound dispatch path.

use super::*;
use crate::testutil::{owner, stack, wait_until, TestStack};
use crate::wa::InboundMessage;

fn draft(session_id: &str, name: &str, trigger: RuleTrigger) -> RuleDraft {
    RuleDraft {
        session_id: session_id.to_string(),
        name: name.to_string(),
        trigger,
        keywords: vec![],
        response: "OK".to_string(),
        priority: 0,
        delay_min_s: 0,
        delay_max_s: 0,
        time_start: None,
        time_end: None,
        daily_cap: None,
        is_active: true,
    }
}

async fn connected(stack: &TestStack) -> String {
    stack.connected_session("15551234567", &owner()).await
}

#[tokio::test]
async fn test_keyword_rule_respects_daily_cap() {
    let stack = stack().await;
    let session = connected(&stack).await;
    let mut d = draft(&session, "help desk", RuleTrigger::Keyword);
    d.keywords = vec!["help".to_string()];
    d.priority = 10;
    d.daily_cap = Some(5);
    let rule = stack.autoreply.create_rule(&d).await.expect("rule");

    let sim = stack.sim(&session);
    for i in 0..6 {
        sim.emit_message(InboundMessage::text(
            &format!("M{i}"),
            "15550001111",
            "I need help",
        ));
    }

    let sim_poll = sim.clone();
    wait_until(|| sim_poll.sent().len() == 5, "five replies").await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // The sixth is suppressed before sending and leaves no log row.
    assert_eq!(sim.sent().len(), 5);
    let logs = stack.autoreply.logs(&session, 20).await.expect("logs");
    assert_eq!(logs.len(), 5);
    assert!(logs.iter().all(|l| l.success));
    assert!(logs.iter().all(|l| l.contact_phone == "15550001111"));

    let stored = stack.autoreply.store().get(&rule.id).await.expect("rule");
    assert_eq!(stored.usage_count, 5);
}

#[tokio::test]
async fn test_higher_priority_rule_wins() {
    let stack = stack().await;
    let session = connected(&stack).await;

    let mut catch_all = draft(&session, "catch all", RuleTrigger::All);
    catch_all.priority = 1;
    catch_all.response = "fallback".to_string();
    stack.autoreply.create_rule(&catch_all).await.expect("rule");

    let mut greeting = draft(&session, "greeting", RuleTrigger::Keyword);
    greeting.priority = 10;
    greeting.keywords = vec!["hi".to_string()];
    greeting.response = "hello there".to_string();
    stack.autoreply.create_rule(&greeting).await.expect("rule");

    let sim = stack.sim(&session);
    sim.emit_message(InboundMessage::text("M1", "15550001111", "hi there"));
    let sim_poll = sim.clone();
    wait_until(|| sim_poll.sent().len() == 1, "keyword reply").await;
    assert_eq!(sim.sent()[0].body(), "hello there");

    sim.emit_message(InboundMessage::text("M2", "15550002222", "good day"));
    let sim_poll = sim.clone();
    wait_until(|| sim_poll.sent().len() == 2, "fallback reply").await;
    assert_eq!(sim.sent()[1].body(), "fallback");
}

#[tokio::test]
async fn test_new_contact_rule_fires_once_per_day() {
    let stack = stack().await;
    let session = connected(&stack).await;
    let mut d = draft(&session, "welcome", RuleTrigger::NewContact);
    d.response = "welcome!".to_string();
    stack.autoreply.create_rule(&d).await.expect("rule");

    let sim = stack.sim(&session);
    sim.emit_message(InboundMessage::text("M1", "15550001111", "first"));
    let sim_poll = sim.clone();
    wait_until(|| sim_poll.sent().len() == 1, "welcome reply").await;

    // The same contact is no longer "new" once a reply is tracked.
    sim.emit_message(InboundMessage::text("M2", "15550001111", "second"));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(sim.sent().len(), 1);

    // A different contact is still new.
    sim.emit_message(InboundMessage::text("M3", "15550002222", "other"));
    let sim_poll = sim.clone();
    wait_until(|| sim_poll.sent().len() == 2, "second welcome").await;
}

#[tokio::test]
async fn test_time_window_gates_matched_rule() {
    let stack = stack().await;
    let session = connected(&stack).await;

    let now = chrono::Local::now();
    let fmt = |offset_h: i64| (now + chrono::Duration::hours(offset_h)).format("%H:%M").to_string();

    let mut closed = draft(&session, "off hours", RuleTrigger::All);
    closed.time_start = Some(fmt(2));
    closed.time_end = Some(fmt(3));
    stack.autoreply.create_rule(&closed).await.expect("rule");

    let sim = stack.sim(&session);
    sim.emit_message(InboundMessage::text("M1", "15550001111", "anyone?"));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(sim.sent().is_empty());

    // Widen the window to include the current time and try again.
    let mut open = draft(&session, "open hours", RuleTrigger::All);
    open.time_start = Some(fmt(-1));
    open.time_end = Some(fmt(1));
    open.priority = 5;
    stack.autoreply.create_rule(&open).await.expect("rule");

    sim.emit_message(InboundMessage::text("M2", "15550001111", "anyone?"));
    let sim_poll = sim.clone();
    wait_until(|| sim_poll.sent().len() == 1, "reply within window").await;
}

#[tokio::test(start_paused = true)]
async fn test_delayed_reply_is_dispatched_after_sleep() {
    let stack = stack().await;
    let session = connected(&stack).await;
    let mut d = draft(&session, "slow", RuleTrigger::All);
    d.delay_min_s = 2;
    d.delay_max_s = 2;
    stack.autoreply.create_rule(&d).await.expect("rule");

    let sim = stack.sim(&session);
    sim.emit_message(InboundMessage::text("M1", "15550001111", "ping"));

    // The reply waits out the delay on a spawned task.
    tokio::task::yield_now().await;
    assert!(sim.sent().is_empty());

    let sim_poll = sim.clone();
    wait_until(|| sim_poll.sent().len() == 1, "delayed reply").await;
    let mut logged = false;
    for _ in 0..500 {
        let logs = stack.autoreply.logs(&session, 10).await.expect("logs");
        if logs.len() == 1 {
            assert!(logs[0].success);
            logged = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    assert!(logged, "reply was never logged");
}

#[tokio::test]
async fn test_failed_send_is_logged_without_usage_increment() {
    let stack = stack().await;
    let session = connected(&stack).await;
    let rule = stack
        .autoreply
        .create_rule(&draft(&session, "always", RuleTrigger::All))
        .await
        .expect("rule");

    let sim = stack.sim(&session);
    sim.fail_next_sends(1);
    sim.emit_message(InboundMessage::text("M1", "15550001111", "hi"));

    let mut logged = false;
    for _ in 0..500 {
        let logs = stack.autoreply.logs(&session, 10).await.expect("logs");
        if !logs.is_empty() {
            assert!(!logs[0].success);
            assert!(logs[0].error_msg.is_some());
            logged = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    assert!(logged, "failed attempt was never logged");

    let stored = stack.autoreply.store().get(&rule.id).await.expect("rule");
    assert_eq!(stored.usage_count, 0);
}

#[tokio::test]
async fn test_group_and_own_messages_are_ignored() {
    let stack = stack().await;
    let session = connected(&stack).await;
    stack
        .autoreply
        .create_rule(&draft(&session, "always", RuleTrigger::All))
        .await
        .expect("rule");

    let sim = stack.sim(&session);
    let mut group = InboundMessage::text("M1", "15550001111", "hello");
    group.is_group = true;
    sim.emit_message(group);
    let mut own = InboundMessage::text("M2", "15550001111", "hello");
    own.is_from_me = true;
    sim.emit_message(own);

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(sim.sent().is_empty());
}

#[tokio::test]
async fn test_reset_counters_reopens_the_cap() {
    let stack = stack().await;
    let session = connected(&stack).await;
    let mut d = draft(&session, "limited", RuleTrigger::All);
    d.daily_cap = Some(1);
    stack.autoreply.create_rule(&d).await.expect("rule");

    let sim = stack.sim(&session);
    sim.emit_message(InboundMessage::text("M1", "15550001111", "one"));
    let sim_poll = sim.clone();
    wait_until(|| sim_poll.sent().len() == 1, "first reply").await;

    sim.emit_message(InboundMessage::text("M2", "15550001111", "two"));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(sim.sent().len(), 1);

    stack.autoreply.reset_counters().await;
    sim.emit_message(InboundMessage::text("M3", "15550001111", "three"));
    let sim_poll = sim.clone();
    wait_until(|| sim_poll.sent().len() == 2, "reply after reset").await;
}

#[tokio::test]
async fn test_test_rule_reports_without_sending() {
    let stack = stack().await;
    let session = connected(&stack).await;
    let mut d = draft(&session, "help desk", RuleTrigger::Keyword);
    d.keywords = vec!["help".to_string()];
    d.delay_min_s = 1;
    d.delay_max_s = 3;
    let rule = stack.autoreply.create_rule(&d).await.expect("rule");

    let hit = stack
        .autoreply
        .test_rule(&rule.id, "please help me", "15550009999")
        .await
        .expect("test");
    assert!(hit.would_trigger);
    assert_eq!(hit.response.as_deref(), Some("OK"));
    let delay = hit.delay_s.expect("delay");
    assert!((1..=3).contains(&delay));

    let miss = stack
        .autoreply
        .test_rule(&rule.id, "good morning", "15550009999")
        .await
        .expect("test");
    assert!(!miss.would_trigger);
    assert!(miss.reason.contains("does not match"));

    // Nothing was sent or logged by either evaluation.
    assert!(stack.sim(&session).sent().is_empty());
    assert!(stack.autoreply.logs(&session, 10).await.expect("logs").is_empty());

    let mut inactive = d.clone();
    inactive.is_active = false;
    let updated = stack
        .autoreply
        .update_rule(&rule.id, &inactive)
        .await
        .expect("update");
    let off = stack
        .autoreply
        .test_rule(&updated.id, "please help me", "15550009999")
        .await
        .expect("test");
    assert!(!off.would_trigger);
    assert!(off.reason.contains("inactive"));
}

#[tokio::test]
async fn test_rule_crud_and_log_purge() {
    let stack = stack().await;
    let session = connected(&stack).await;
    let rule = stack
        .autoreply
        .create_rule(&draft(&session, "always", RuleTrigger::All))
        .await
        .expect("rule");
    assert_eq!(stack.autoreply.list_rules(&session).await.expect("list").len(), 1);

    let sim = stack.sim(&session);
    sim.emit_message(InboundMessage::text("M1", "15550001111", "hi"));
    let sim_poll = sim.clone();
    wait_until(|| sim_poll.sent().len() == 1, "reply").await;

    let autoreply = stack.autoreply.clone();
    let session_poll = session.clone();
    for _ in 0..500 {
        if !autoreply.logs(&session_poll, 10).await.expect("logs").is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let purged = stack
        .autoreply
        .store()
        .purge_logs_before(chrono::Utc::now().timestamp() + 1)
        .await
        .expect("purge");
    assert_eq!(purged, 1);

    stack.autoreply.delete_rule(&rule.id).await.expect("delete");
    assert!(stack.autoreply.list_rules(&session).await.expect("list").is_empty());
}
