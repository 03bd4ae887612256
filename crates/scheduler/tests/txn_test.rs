use std::time::Duration;

use nca_scheduler::{
	Error, KeyError, Origin, Transaction, TxnKind, TxnOperation, ValueState, ValueStatus,
};

use tracing_test::traced_test;

mod common;

use common::{setup, Item};

fn pending(labels: &[&str]) -> ValueStatus {
	ValueStatus::Pending(labels.iter().map(ToString::to_string).collect())
}

#[tokio::test]
#[traced_test]
async fn test_dependencies_are_applied_first() {
	let (scheduler, sb) = setup();

	let report = scheduler
		.submit(
			Transaction::new()
				.put("bd/b1", Item::new("b1").depends_on("interface", "if/if1"))
				.put("if/if1", Item::new("if1")),
		)
		.await
		.unwrap();

	assert!(report.is_success());
	assert_eq!(report.outcome("bd/b1"), Some(&ValueStatus::Applied));
	assert_eq!(report.outcome("if/if1"), Some(&ValueStatus::Applied));
	assert_eq!(sb.ops(), vec!["create if/if1", "create bd/b1"]);

	assert_eq!(scheduler.value("bd/b1").state, ValueState::Configured);
	assert!(scheduler.lookup_by_key("interface", "if/if1").is_some());

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_pending_value_is_applied_once_dependency_shows_up() {
	let (scheduler, sb) = setup();

	let report = scheduler
		.submit(
			Transaction::new().put("bd/b1", Item::new("b1").depends_on("interface", "if/if1")),
		)
		.await
		.unwrap();

	assert_eq!(
		report.outcome("bd/b1"),
		Some(&pending(&["interface:if/if1"]))
	);
	assert!(sb.ops().is_empty());

	let pending_values = scheduler.pending_values(|_| true);
	assert_eq!(pending_values.len(), 1);
	assert_eq!(pending_values[0].unmet, vec!["interface:if/if1"]);

	let mut watcher = scheduler.watch(|key| key.starts_with("bd/"));

	scheduler
		.submit(Transaction::new().put("if/if1", Item::new("if1")))
		.await
		.unwrap();
	scheduler.barrier().await.unwrap();

	let event = watcher.next().await.unwrap();
	assert_eq!(event.outcome.key, "bd/b1");
	assert_eq!(event.outcome.status, ValueStatus::Applied);

	assert_eq!(scheduler.value("bd/b1").state, ValueState::Configured);
	assert!(scheduler.pending_values(|_| true).is_empty());
	assert_eq!(sb.ops(), vec!["create if/if1", "create bd/b1"]);

	let retry = scheduler.txn_record(event.txn_seq).unwrap();
	assert_eq!(retry.kind, TxnKind::RetryPending);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_any_of_dependency() {
	let (scheduler, _sb) = setup();

	let report = scheduler
		.submit(Transaction::new().put("bd/b1", Item::new("b1").needs_any("uplink", "if/")))
		.await
		.unwrap();
	assert_eq!(
		report.outcome("bd/b1"),
		Some(&pending(&["uplink:any-of[if/]"]))
	);

	scheduler
		.submit(Transaction::new().put("if/eth0", Item::new("eth0")))
		.await
		.unwrap();
	scheduler.barrier().await.unwrap();

	assert_eq!(scheduler.value("bd/b1").state, ValueState::Configured);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_delete_takes_dependents_down_first() {
	let (scheduler, sb) = setup();

	scheduler
		.submit(
			Transaction::new()
				.put("if/if1", Item::new("if1"))
				.put("bd/b1", Item::new("b1").depends_on("interface", "if/if1")),
		)
		.await
		.unwrap();
	sb.take_ops();

	let report = scheduler
		.submit(Transaction::new().delete("if/if1"))
		.await
		.unwrap();

	assert_eq!(report.outcome("if/if1"), Some(&ValueStatus::Deleted));
	assert_eq!(
		report.outcome("bd/b1"),
		Some(&pending(&["interface:if/if1"]))
	);
	assert_eq!(sb.ops(), vec!["delete bd/b1", "delete if/if1"]);

	assert_eq!(scheduler.value("if/if1").state, ValueState::Removed);
	assert_eq!(scheduler.value("bd/b1").state, ValueState::Pending);
	assert!(scheduler.lookup_by_key("interface", "if/if1").is_none());

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_update_in_place_and_recreate() {
	let (scheduler, sb) = setup();

	scheduler
		.submit(
			Transaction::new()
				.put("if/if1", Item::new("if1"))
				.put("bd/b1", Item::new("b1").depends_on("interface", "if/if1"))
				.put("bd/b2", Item::new("b2")),
		)
		.await
		.unwrap();
	sb.take_ops();

	let report = scheduler
		.submit(Transaction::new().put("if/if1", Item::new("if1 mtu 9000")))
		.await
		.unwrap();
	assert_eq!(report.outcome("if/if1"), Some(&ValueStatus::Updated));
	assert_eq!(report.outcome("bd/b1"), None);
	assert_eq!(sb.take_ops(), vec!["update if/if1"]);

	let report = scheduler
		.submit(Transaction::new().put("bd/b2", Item::new("b2 flood")))
		.await
		.unwrap();
	assert_eq!(report.outcome("bd/b2"), Some(&ValueStatus::Updated));
	assert_eq!(sb.take_ops(), vec!["delete bd/b2", "create bd/b2"]);

	let record = scheduler.txn_record(report.seq_num).unwrap();
	assert!(record.executed.iter().all(|op| op.is_recreate));

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_recreate_takes_dependents_down_and_back() {
	let (scheduler, sb) = setup();

	scheduler
		.submit(
			Transaction::new()
				.put("bd/b1", Item::new("b1"))
				.put("if/if1", Item::new("if1").depends_on("bridge", "bd/b1")),
		)
		.await
		.unwrap();
	sb.take_ops();

	let report = scheduler
		.submit(Transaction::new().put("bd/b1", Item::new("b1 learn")))
		.await
		.unwrap();

	assert_eq!(report.outcome("bd/b1"), Some(&ValueStatus::Updated));
	assert_eq!(report.outcome("if/if1"), Some(&ValueStatus::Updated));
	assert_eq!(
		sb.ops(),
		vec!["delete if/if1", "delete bd/b1", "create bd/b1", "create if/if1"]
	);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_equivalent_value_is_skipped() {
	let (scheduler, sb) = setup();

	scheduler
		.submit(Transaction::new().put("if/if1", Item::new("if1")))
		.await
		.unwrap();
	sb.take_ops();

	let report = scheduler
		.submit(Transaction::new().put("if/if1", Item::new("if1")))
		.await
		.unwrap();

	assert_eq!(report.outcome("if/if1"), Some(&ValueStatus::Skipped));
	assert!(sb.ops().is_empty());

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_key_errors_stay_with_their_key() {
	let (scheduler, sb) = setup();
	sb.fail_on("if/broken");

	let report = scheduler
		.submit(
			Transaction::new()
				.put("if/empty", Item::new(""))
				.put("if/broken", Item::new("broken"))
				.put("nope/x", Item::new("x"))
				.put("if/ok", Item::new("ok")),
		)
		.await
		.unwrap();

	assert!(!report.is_success());
	assert_eq!(report.errors().count(), 3);
	assert_eq!(report.outcome("if/ok"), Some(&ValueStatus::Applied));

	let Some(ValueStatus::Failed(KeyError::Validation(e))) = report.outcome("if/empty") else {
		panic!("expected a validation error");
	};
	assert_eq!(e.invalid_fields, vec!["text"]);

	assert!(matches!(
		report.outcome("if/broken"),
		Some(ValueStatus::Failed(KeyError::Operation {
			operation: TxnOperation::Create,
			..
		}))
	));
	assert_eq!(
		report.outcome("nope/x"),
		Some(&ValueStatus::Failed(KeyError::Unimplemented))
	);

	assert_eq!(scheduler.value("if/empty").state, ValueState::Invalid);
	assert_eq!(scheduler.value("if/broken").state, ValueState::Failed);
	assert_eq!(scheduler.value("nope/x").state, ValueState::Unimplemented);

	let mut failed = scheduler
		.failed_values(|_| true)
		.into_iter()
		.map(|view| view.key)
		.collect::<Vec<_>>();
	failed.sort();
	assert_eq!(failed, vec!["if/broken", "if/empty", "nope/x"]);

	sb.heal("if/broken");
	let report = scheduler
		.submit(Transaction::new().put("if/broken", Item::new("broken")))
		.await
		.unwrap();
	assert_eq!(report.outcome("if/broken"), Some(&ValueStatus::Applied));

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_dependency_cycle_fails_its_members() {
	let (scheduler, sb) = setup();

	let report = scheduler
		.submit(
			Transaction::new()
				.put("if/a", Item::new("a").depends_on("peer", "if/b"))
				.put("if/b", Item::new("b").depends_on("peer", "if/a"))
				.put("bd/c", Item::new("c").depends_on("interface", "if/a")),
		)
		.await
		.unwrap();

	for key in ["if/a", "if/b"] {
		assert!(
			matches!(
				report.outcome(key),
				Some(ValueStatus::Failed(KeyError::Cycle { cycle })) if cycle.len() == 2
			),
			"{key}: {:?}",
			report.outcome(key)
		);
	}
	assert_eq!(report.outcome("bd/c"), Some(&pending(&["interface:if/a"])));
	assert!(sb.ops().is_empty());

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_cycle_across_transactions_is_rejected() {
	let (scheduler, sb) = setup();

	let report = scheduler
		.submit(Transaction::new().put("if/a", Item::new("a").depends_on("peer", "if/b")))
		.await
		.unwrap();
	assert_eq!(report.outcome("if/a"), Some(&pending(&["peer:if/b"])));

	let report = scheduler
		.submit(Transaction::new().put("if/b", Item::new("b").depends_on("peer", "if/a")))
		.await
		.unwrap();
	scheduler.barrier().await.unwrap();

	for key in ["if/a", "if/b"] {
		assert!(
			matches!(
				report.outcome(key),
				Some(ValueStatus::Failed(KeyError::Cycle { cycle })) if cycle.len() == 2
			),
			"{key}: {:?}",
			report.outcome(key)
		);
		assert_eq!(scheduler.value(key).state, ValueState::Failed);
	}
	assert!(scheduler.pending_values(|_| true).is_empty());
	assert!(sb.ops().is_empty());

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_pending_dependents_are_not_applied_by_the_transaction() {
	let (scheduler, _sb) = setup();

	scheduler
		.submit(Transaction::new().put("bd/b1", Item::new("b1").depends_on("interface", "if/if1")))
		.await
		.unwrap();

	let report = scheduler
		.submit(Transaction::new().put("if/if1", Item::new("if1")))
		.await
		.unwrap();

	// Revalidated for cycles only, the retry loop applies it.
	assert_eq!(report.outcome("bd/b1"), None);

	scheduler.barrier().await.unwrap();
	assert_eq!(scheduler.value("bd/b1").state, ValueState::Configured);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_shutdown_parks_the_rest_of_a_transaction() {
	let (scheduler, sb) = setup();
	sb.slow_down(Duration::from_millis(100));

	let submit = tokio::spawn({
		let scheduler = scheduler.clone();
		async move {
			scheduler
				.submit(
					Transaction::new()
						.put("if/if1", Item::new("if1"))
						.put("if/if2", Item::new("if2"))
						.put("if/if3", Item::new("if3")),
				)
				.await
		}
	});

	// The first create is done, the second one is in flight.
	tokio::time::sleep(Duration::from_millis(150)).await;
	scheduler.shutdown().await;

	let report = submit.await.unwrap().unwrap();

	let applied = report
		.outcomes
		.iter()
		.filter(|outcome| outcome.status == ValueStatus::Applied)
		.map(|outcome| outcome.key.clone())
		.collect::<Vec<_>>();
	let parked = report
		.outcomes
		.iter()
		.filter(|outcome| outcome.status == pending(&[]))
		.map(|outcome| outcome.key.clone())
		.collect::<Vec<_>>();

	assert_eq!(applied.len(), 2, "{:?}", report.outcomes);
	assert_eq!(parked.len(), 1, "{:?}", report.outcomes);
	assert!(!sb.contains(&parked[0]));
	assert_eq!(scheduler.value(&parked[0]).state, ValueState::Pending);
	for key in &applied {
		assert!(sb.contains(key));
	}
}

#[tokio::test]
#[traced_test]
async fn test_derived_values() {
	let (scheduler, sb) = setup();

	let report = scheduler
		.submit(
			Transaction::new().put(
				"if/if1",
				Item::new("if1")
					.derives("addr/if1/10.0.0.1", Item::new("10.0.0.1/24"))
					.derives("flag/if1/up", Item::new("up")),
			),
		)
		.await
		.unwrap();

	assert!(report.is_success());
	assert_eq!(
		sb.ops(),
		vec!["create if/if1", "create addr/if1/10.0.0.1"]
	);

	let address = scheduler.value("addr/if1/10.0.0.1");
	assert_eq!(address.derived_from.as_deref(), Some("if/if1"));
	assert_eq!(address.state, ValueState::Configured);

	let flag = scheduler.value("flag/if1/up");
	assert_eq!(flag.descriptor, None);
	assert_eq!(flag.state, ValueState::Configured);

	let outcome = report
		.outcomes
		.iter()
		.find(|outcome| outcome.key == "addr/if1/10.0.0.1")
		.unwrap();
	assert_eq!(outcome.derived_from.as_deref(), Some("if/if1"));

	let report = scheduler
		.submit(Transaction::new().put("addr/if1/10.0.0.1", Item::new("10.0.0.2/24")))
		.await
		.unwrap();
	assert_eq!(
		report.outcome("addr/if1/10.0.0.1"),
		Some(&ValueStatus::Failed(KeyError::DerivedKey {
			base: "if/if1".to_string()
		}))
	);

	sb.take_ops();
	let report = scheduler
		.submit(Transaction::new().delete("if/if1"))
		.await
		.unwrap();

	assert_eq!(
		report.outcome("addr/if1/10.0.0.1"),
		Some(&ValueStatus::Deleted)
	);
	assert_eq!(report.outcome("flag/if1/up"), Some(&ValueStatus::Deleted));
	assert_eq!(sb.ops(), vec!["delete addr/if1/10.0.0.1", "delete if/if1"]);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_dry_run_leaves_everything_untouched() {
	let (scheduler, sb) = setup();

	let report = scheduler
		.submit(
			Transaction::new()
				.put("if/if1", Item::new("if1"))
				.put("bd/b1", Item::new("b1").depends_on("interface", "if/if1"))
				.dry_run(),
		)
		.await
		.unwrap();

	assert!(report.dry_run);
	assert_eq!(report.outcome("bd/b1"), Some(&ValueStatus::Applied));
	assert_eq!(
		report
			.executed
			.iter()
			.map(|op| (op.key.as_str(), op.operation))
			.collect::<Vec<_>>(),
		vec![
			("if/if1", TxnOperation::Create),
			("bd/b1", TxnOperation::Create)
		]
	);

	assert!(sb.ops().is_empty());
	assert_eq!(scheduler.value("if/if1").state, ValueState::NonExistent);
	assert!(scheduler.values(|_| true).is_empty());

	let record = scheduler.txn_record(report.seq_num).unwrap();
	assert!(record.dry_run);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_history_keeps_records() {
	let (scheduler, _sb) = setup();

	let report = scheduler
		.submit(
			Transaction::new()
				.put("if/if1", Item::new("if1"))
				.with_description("initial interfaces"),
		)
		.await
		.unwrap();

	let history = scheduler.history();
	assert_eq!(history.len(), 1);

	let record = &history[0];
	assert_eq!(record.seq_num, report.seq_num);
	assert_eq!(record.kind, TxnKind::Northbound);
	assert_eq!(record.description.as_deref(), Some("initial interfaces"));
	assert_eq!(record.values.len(), 1);
	assert_eq!(record.executed.len(), 1);
	assert_eq!(record.executed[0].operation, TxnOperation::Create);
	assert_eq!(record.executed[0].new_state, ValueState::Configured);
	assert!(record.start <= record.stop);

	let json = serde_json::to_value(record).unwrap();
	assert_eq!(json["kind"], "northbound");

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_southbound_notifications() {
	let (scheduler, sb) = setup();

	scheduler
		.submit(
			Transaction::new().put("bd/b1", Item::new("b1").depends_on("interface", "if/ext")),
		)
		.await
		.unwrap();

	let report = scheduler
		.push_sb_notification("if/ext", Some(std::sync::Arc::new(Item::new("ext"))), None)
		.await
		.unwrap();
	assert_eq!(report.outcome("if/ext"), Some(&ValueStatus::Applied));
	scheduler.barrier().await.unwrap();

	let ext = scheduler.value("if/ext");
	assert_eq!(ext.state, ValueState::Obtained);
	assert_eq!(ext.origin, Origin::Southbound);
	assert_eq!(scheduler.value("bd/b1").state, ValueState::Configured);
	assert_eq!(sb.take_ops(), vec!["create bd/b1"]);

	let report = scheduler
		.submit(Transaction::new().delete("if/ext"))
		.await
		.unwrap();
	assert_eq!(report.outcome("if/ext"), Some(&ValueStatus::Skipped));
	assert!(sb.ops().is_empty());

	let report = scheduler
		.push_sb_notification("if/ext", None, None)
		.await
		.unwrap();
	assert_eq!(report.outcome("if/ext"), Some(&ValueStatus::Deleted));
	assert_eq!(
		report.outcome("bd/b1"),
		Some(&pending(&["interface:if/ext"]))
	);
	assert_eq!(sb.ops(), vec!["delete bd/b1"]);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_notifications_for_northbound_keys_are_ignored() {
	let (scheduler, sb) = setup();

	scheduler
		.submit(Transaction::new().put("if/if1", Item::new("if1")))
		.await
		.unwrap();

	let report = scheduler
		.push_sb_notification("if/if1", None, None)
		.await
		.unwrap();

	assert!(report.outcomes.is_empty());
	assert_eq!(scheduler.value("if/if1").state, ValueState::Configured);
	assert_eq!(sb.ops(), vec!["create if/if1"]);

	scheduler.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn test_requests_after_shutdown_are_rejected() {
	let (scheduler, _sb) = setup();

	scheduler.shutdown().await;

	assert!(matches!(
		scheduler
			.submit(Transaction::new().put("if/if1", Item::new("if1")))
			.await,
		Err(Error::Shutdown)
	));
	assert!(matches!(scheduler.barrier().await, Err(Error::Shutdown)));
}
