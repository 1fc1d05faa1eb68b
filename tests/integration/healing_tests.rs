//! Self-healing verification: the approved-write flow, automatic rollback
//! on an unhealthy deployment, and deploy-gate decisions.

use std::time::Duration;

use filewright::healing::FORCE_ROLLBACK_MARKER;
use filewright::models::task::{AwaitingType, TaskFlags, TaskStatus};
use filewright::worker::runner::TaskInput;

use super::test_helpers::{
    harness, one_file_fixture, read_remote_file, seed_remote_file, session_key, submit, wait_until,
};

const WAIT: Duration = Duration::from_secs(5);

fn flags() -> TaskFlags {
    TaskFlags {
        dry_run: false,
        test_mode: false,
        webhook_url: Some("https://callback.test/hook".into()),
    }
}

fn approve() -> TaskInput {
    TaskInput {
        approval: Some(true),
        answer: None,
    }
}

fn reject() -> TaskInput {
    TaskInput {
        approval: Some(false),
        answer: None,
    }
}

#[tokio::test]
async fn healthy_deployment_pauses_for_deploy_confirmation() {
    let (plan, contents) = one_file_fixture("page.php", "<?php render_v2();\n");
    let h = harness(plan, contents, true, |_| {}).await;
    seed_remote_file(&h, "page.php", "<?php render_v1();\n");
    let key = session_key("healthy-deploy");

    let receipt = submit(&h, &key, "upgrade the renderer", flags()).await;
    h.runner.run_active(&key, &receipt.task_id).await.expect("run");
    wait_until(&h.store, &receipt.task_id, WAIT, |t| t.status == TaskStatus::DiffReady).await;

    h.runner.handle_input(&receipt.task_id, approve()).await.expect("approve diff");

    let task = h.store.find_by_task_id(&receipt.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.awaiting_type, Some(AwaitingType::DeployApproval));
    assert_eq!(read_remote_file(&h, "page.php"), "<?php render_v2();\n");
    assert!(
        task.backups().contains_key("page.php"),
        "overwrite must record a backup reference"
    );
    // Verification outcome is recorded on the task.
    let verified = task
        .plan
        .as_ref()
        .and_then(|p| p.get("last_verification"))
        .expect("verification recorded");
    assert_eq!(verified["healthy"], serde_json::json!(true));
    // No completion callback yet; the human still has to confirm.
    assert!(h.notifier.events().is_empty());
}

#[tokio::test]
async fn deploy_confirmation_finalizes_and_notifies() {
    let (plan, contents) = one_file_fixture("page.php", "<?php render_v2();\n");
    let h = harness(plan, contents, true, |_| {}).await;
    seed_remote_file(&h, "page.php", "<?php render_v1();\n");
    let key = session_key("deploy-confirm");

    let receipt = submit(&h, &key, "upgrade the renderer", flags()).await;
    h.runner.run_active(&key, &receipt.task_id).await.expect("run");
    h.runner.handle_input(&receipt.task_id, approve()).await.expect("approve diff");
    h.runner.handle_input(&receipt.task_id, approve()).await.expect("confirm deploy");

    let task = h.store.find_by_task_id(&receipt.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(!task.awaiting_response);
    assert!(task.completed_at.is_some());

    let state = h.store.load(&key).await.unwrap().unwrap();
    assert_eq!(state.session.active_task_id, None);

    let events = h.notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, "completed");
    assert_eq!(events[0].webhook_url, "https://callback.test/hook");
}

#[tokio::test]
async fn unhealthy_deployment_rolls_back_automatically() {
    let (plan, contents) = one_file_fixture("page.php", "<?php broken();\n");
    let h = harness(plan, contents, false, |_| {}).await;
    seed_remote_file(&h, "page.php", "<?php works();\n");
    let key = session_key("auto-heal");

    let receipt = submit(&h, &key, "risky change", flags()).await;
    h.runner.run_active(&key, &receipt.task_id).await.expect("run");
    h.runner.handle_input(&receipt.task_id, approve()).await.expect("approve diff");

    let task = h.store.find_by_task_id(&receipt.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::RolledBack, "bad deployment must auto-rollback");
    assert!(!task.awaiting_response, "human deploy confirmation is skipped");
    assert_eq!(
        read_remote_file(&h, "page.php"),
        "<?php works();\n",
        "written file must be restored from its backup"
    );
    assert!(task.errors.iter().any(|e| e.message.contains("health check failed")));

    let events = h.notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, "auto_healed");
    assert_eq!(events[0].task_id, receipt.task_id);

    let state = h.store.load(&key).await.unwrap().unwrap();
    assert_eq!(state.session.active_task_id, None, "queue advanced");
}

#[tokio::test]
async fn forced_rollback_marker_skips_the_real_probe() {
    let (plan, contents) = one_file_fixture("page.php", "<?php broken();\n");
    // Probe says healthy; the forced marker must override it.
    let h = harness(plan, contents, true, |_| {}).await;
    seed_remote_file(&h, "page.php", "<?php works();\n");
    let key = session_key("forced");

    let test_flags = TaskFlags {
        dry_run: false,
        test_mode: true,
        webhook_url: Some("https://callback.test/hook".into()),
    };
    let instruction = format!("risky change {FORCE_ROLLBACK_MARKER}");
    let receipt = submit(&h, &key, &instruction, test_flags).await;
    h.runner.run_active(&key, &receipt.task_id).await.expect("run");
    h.runner.handle_input(&receipt.task_id, approve()).await.expect("approve diff");

    let task = h.store.find_by_task_id(&receipt.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::RolledBack);
    assert_eq!(read_remote_file(&h, "page.php"), "<?php works();\n");
    assert_eq!(h.notifier.events()[0].status, "auto_healed");
}

#[tokio::test]
async fn forced_rollback_marker_is_ignored_outside_test_mode() {
    let (plan, contents) = one_file_fixture("page.php", "<?php v2();\n");
    let h = harness(plan, contents, true, |_| {}).await;
    seed_remote_file(&h, "page.php", "<?php v1();\n");
    let key = session_key("marker-prod");

    let instruction = format!("change {FORCE_ROLLBACK_MARKER}");
    let receipt = submit(&h, &key, &instruction, flags()).await;
    h.runner.run_active(&key, &receipt.task_id).await.expect("run");
    h.runner.handle_input(&receipt.task_id, approve()).await.expect("approve diff");

    // Production task: real (stubbed healthy) probe ran, no rollback.
    let task = h.store.find_by_task_id(&receipt.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.awaiting_type, Some(AwaitingType::DeployApproval));
}

#[tokio::test]
async fn deploy_rejection_restores_backups() {
    let (plan, contents) = one_file_fixture("page.php", "<?php regret();\n");
    let h = harness(plan, contents, true, |_| {}).await;
    seed_remote_file(&h, "page.php", "<?php keep_me();\n");
    let key = session_key("deploy-reject");

    let receipt = submit(&h, &key, "second thoughts", flags()).await;
    h.runner.run_active(&key, &receipt.task_id).await.expect("run");
    h.runner.handle_input(&receipt.task_id, approve()).await.expect("approve diff");
    h.runner.handle_input(&receipt.task_id, reject()).await.expect("reject deploy");

    let task = h.store.find_by_task_id(&receipt.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::RolledBack);
    assert_eq!(read_remote_file(&h, "page.php"), "<?php keep_me();\n");
    assert_eq!(h.notifier.events()[0].status, "rolled_back");
}

#[tokio::test]
async fn diff_rejection_fails_the_task_and_advances() {
    let (plan, contents) = one_file_fixture("page.php", "<?php unwanted();\n");
    let h = harness(plan, contents, true, |_| {}).await;
    seed_remote_file(&h, "page.php", "<?php original();\n");
    let key = session_key("diff-reject");

    let receipt = submit(&h, &key, "never mind", flags()).await;
    h.runner.run_active(&key, &receipt.task_id).await.expect("run");
    h.runner.handle_input(&receipt.task_id, reject()).await.expect("reject diff");

    let task = h.store.find_by_task_id(&receipt.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.errors.iter().any(|e| e.message.contains("rejected")));
    // Nothing was written.
    assert_eq!(read_remote_file(&h, "page.php"), "<?php original();\n");
    assert_eq!(h.notifier.events()[0].status, "failed");
}
