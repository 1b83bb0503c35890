//! Live numeric inputs driving CALC rule conditions, and the write audit
//! hooks on the engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use warden::{AccessRights, Error, Identity, SecurityEngine, TrapWritePhase};

const CALC_CONFIG: &str = "
ASG(DEFAULT) {
	RULE(0, NONE)
}

ASG(lim) {
	INPA(thermo:outlet:temp)
	RULE(0, NONE)
	RULE(1, WRITE, TRAPWRITE) {
		CALC(\"A\")
	}
}
";

fn identity(user: &str) -> Identity {
    Identity {
        user: user.to_string(),
        host: "localhost".to_string(),
        method: "ca".to_string(),
        ..Default::default()
    }
}

#[test]
fn test_calc_gates_on_input_value() {
    let engine = SecurityEngine::new();
    engine.init_from_str(CALC_CONFIG, false).unwrap();

    let member = engine.add_member("lim").unwrap();
    let client = engine.add_client(&member, 0, identity("op")).unwrap();

    // no input seen yet: the condition defaults to false
    assert_eq!(client.access(), AccessRights::None);

    engine.set_input("lim", 0, Some(1.0)).unwrap();
    engine.recompute_group("lim").unwrap();
    assert_eq!(client.access(), AccessRights::Write);
    assert!(client.trap_write());

    engine.set_input("lim", 0, Some(2.0)).unwrap();
    engine.recompute_group("lim").unwrap();
    assert_eq!(client.access(), AccessRights::None);

    // the truth window is 0.99 < r < 1.01
    engine.set_input("lim", 0, Some(0.995)).unwrap();
    engine.recompute_group("lim").unwrap();
    assert_eq!(client.access(), AccessRights::Write);

    engine.set_input("lim", 0, Some(0.99)).unwrap();
    engine.recompute_group("lim").unwrap();
    assert_eq!(client.access(), AccessRights::None);

    engine.remove_client(client).unwrap();
    engine.remove_member(member).unwrap();
}

#[test]
fn test_bad_input_blocks_rule() {
    let engine = SecurityEngine::new();
    engine.init_from_str(CALC_CONFIG, false).unwrap();

    let member = engine.add_member("lim").unwrap();
    let client = engine.add_client(&member, 0, identity("op")).unwrap();

    engine.set_input("lim", 0, Some(1.0)).unwrap();
    engine.recompute_group("lim").unwrap();
    assert_eq!(client.access(), AccessRights::Write);

    // a bad input vetoes the rule regardless of the last good value
    engine.set_input("lim", 0, None).unwrap();
    engine.recompute_group("lim").unwrap();
    assert_eq!(client.access(), AccessRights::None);

    engine.set_input("lim", 0, Some(1.0)).unwrap();
    engine.recompute_group("lim").unwrap();
    assert_eq!(client.access(), AccessRights::Write);

    engine.remove_client(client).unwrap();
    engine.remove_member(member).unwrap();
}

#[test]
fn test_input_errors() {
    let engine = SecurityEngine::new();
    engine.init_from_str(CALC_CONFIG, false).unwrap();

    assert!(matches!(
        engine.set_input("nope", 0, Some(1.0)),
        Err(Error::BadAsg)
    ));
    assert!(matches!(
        engine.set_input("lim", 12, Some(1.0)),
        Err(Error::BadCalc(_))
    ));
}

#[test]
fn test_write_audit_hooks() {
    let engine = SecurityEngine::new();
    engine.init_from_str(CALC_CONFIG, false).unwrap();

    let member = engine.add_member("lim").unwrap();
    let client = engine.add_client(&member, 0, identity("op")).unwrap();

    let pre = Arc::new(AtomicUsize::new(0));
    let post = Arc::new(AtomicUsize::new(0));
    let pre_counter = pre.clone();
    let post_counter = post.clone();
    engine.trap_writes().register_listener(move |message, phase| {
        assert_eq!(message.identity.user, "op");
        assert_eq!(message.target, "thermo:outlet:setpoint");
        match phase {
            TrapWritePhase::Before => pre_counter.fetch_add(1, Ordering::SeqCst),
            TrapWritePhase::After => post_counter.fetch_add(1, Ordering::SeqCst),
        };
    });

    // the client holds no TRAPWRITE grant yet, writes are not audited
    let token = engine.write_notify_before(&client, "thermo:outlet:setpoint", 0, 1, None);
    assert!(token.is_none());
    engine.write_notify_after(token);
    assert_eq!(pre.load(Ordering::SeqCst), 0);

    // once the TRAPWRITE rule applies, each write produces a pre/post pair
    engine.set_input("lim", 0, Some(1.0)).unwrap();
    engine.recompute_group("lim").unwrap();
    assert!(client.trap_write());

    let token = engine.write_notify_before(&client, "thermo:outlet:setpoint", 0, 1, None);
    assert!(token.is_some());
    assert_eq!(pre.load(Ordering::SeqCst), 1);
    assert_eq!(post.load(Ordering::SeqCst), 0);
    engine.write_notify_after(token);
    assert_eq!(post.load(Ordering::SeqCst), 1);

    engine.remove_client(client).unwrap();
    engine.remove_member(member).unwrap();
}
