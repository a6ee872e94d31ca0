//! Event/response contract, administrative requests and listener notices.


use renderq::protocol::{
    Event, ListenRequest, ReportStatus, RestartRequest, Response, TaskReport, TasksPos,
};
use renderq::scheduler::{JobState, TaskState};
use serde_json::json;
use test_harness::{at, defaults, job_spec, t0, TestFarm};

fn worker_offer(name: &str) -> Event {
    serde_json::from_value(json!({
        "type": "WorkerOffer",
        "name": name,
        "address": "10.0.0.5:7000",
        "capabilities": ["blender"],
        "memory_mb": 32768
    }))
    .unwrap()
}

#[tokio::test]
async fn test_offer_and_report_through_events() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("j", "alice", 1)).await;

    let exec = match farm.scheduler.handle(worker_offer("r1"), t0()).await {
        Response::Dispatch(exec) => exec,
        other => panic!("expected dispatch, got {:?}", other),
    };
    assert_eq!(exec.job_id, job_id);
    assert_eq!(exec.render, "r1");
    assert_eq!(exec.command, "render t0");

    let report: Event = serde_json::from_value(json!({
        "type": "TaskReport",
        "job_id": job_id,
        "block": 0,
        "task": 0,
        "exec_id": exec.exec_id,
        "render": "r1",
        "status": "Done",
        "percent": null,
        "activity": null,
        "output": null
    }))
    .unwrap();
    assert_eq!(farm.scheduler.handle(report, at(1)).await, Response::Ack);
    assert_eq!(farm.scheduler.job_state(job_id).await, Some(JobState::Done));

    assert_eq!(
        farm.scheduler.handle(worker_offer("r1"), at(2)).await,
        Response::NoWork
    );
}

#[tokio::test]
async fn test_messages_carry_type_tag() {
    let heartbeat = serde_json::to_value(Event::Heartbeat {
        render: "r1".to_string(),
    })
    .unwrap();
    assert_eq!(heartbeat, json!({"type": "Heartbeat", "render": "r1"}));

    let no_work = serde_json::to_value(Response::NoWork).unwrap();
    assert_eq!(no_work, json!({"type": "NoWork"}));

    let rejected = serde_json::to_value(Response::Rejected {
        reason: "nope".to_string(),
    })
    .unwrap();
    assert_eq!(rejected["type"], "Rejected");
}

#[tokio::test]
async fn test_malformed_admin_requests_change_nothing() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("j", "alice", 2)).await;

    let bad_block = Event::AdminSkip(TasksPos {
        job_id,
        block: 5,
        tasks: Vec::new(),
    });
    assert!(matches!(
        farm.scheduler.handle(bad_block, t0()).await,
        Response::Rejected { .. }
    ));

    let bad_task = Event::AdminSkip(TasksPos {
        job_id,
        block: 0,
        tasks: vec![0, 9],
    });
    assert!(matches!(
        farm.scheduler.handle(bad_task, t0()).await,
        Response::Rejected { .. }
    ));

    let unknown_job = Event::AdminRestart(RestartRequest {
        tasks: TasksPos {
            job_id: 99,
            block: 0,
            tasks: Vec::new(),
        },
        reset_errors: false,
    });
    assert!(matches!(
        farm.scheduler.handle(unknown_job, t0()).await,
        Response::Rejected { .. }
    ));

    let heartbeat = Event::Heartbeat {
        render: "ghost".to_string(),
    };
    assert!(matches!(
        farm.scheduler.handle(heartbeat, t0()).await,
        Response::Rejected { .. }
    ));

    let job = farm.scheduler.job_snapshot(job_id).await.unwrap();
    assert!(job
        .blocks[0]
        .tasks
        .iter()
        .all(|t| t.state() == TaskState::Ready));
}

#[tokio::test]
async fn test_skip_running_task_stops_it() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("j", "alice", 2)).await;
    farm.add_renders(&["r1"]).await;
    let exec = farm.offer("r1", t0()).await.unwrap();

    let skip = Event::AdminSkip(TasksPos {
        job_id,
        block: 0,
        tasks: vec![exec.task],
    });
    match farm.scheduler.handle(skip, at(1)).await {
        Response::Stop { executions } => {
            assert_eq!(executions.len(), 1);
            assert_eq!(executions[0].render, "r1");
            assert_eq!(executions[0].exec_id, exec.exec_id);
        }
        other => panic!("expected stop, got {:?}", other),
    }
    assert!(farm.scheduler.render("r1").await.unwrap().is_idle());

    let next = farm.offer("r1", at(2)).await.unwrap();
    assert_ne!(next.task, exec.task);
    farm.finish(&next, at(3)).await;
    let job = farm.scheduler.job_snapshot(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.counters.skipped, 1);
}

#[tokio::test]
async fn test_skip_leaves_done_tasks_and_takes_error_tasks() {
    let farm = TestFarm::with_defaults(defaults(1, 0, 0, 0));
    let job_id = farm.add_job(job_spec("j", "alice", 2)).await;
    farm.add_renders(&["r1"]).await;

    let ok = farm.offer("r1", t0()).await.unwrap();
    farm.finish(&ok, at(1)).await;
    let bad = farm.offer("r1", at(2)).await.unwrap();
    farm.fail(&bad, at(3)).await;
    assert_eq!(farm.scheduler.job_state(job_id).await, Some(JobState::Error));

    let all = TasksPos {
        job_id,
        block: 0,
        tasks: Vec::new(),
    };
    assert!(farm.scheduler.skip_tasks(&all, at(4)).await.unwrap().is_empty());

    let job = farm.scheduler.job_snapshot(job_id).await.unwrap();
    assert_eq!(job.blocks[0].tasks[ok.task].state(), TaskState::Done);
    assert_eq!(job.blocks[0].tasks[bad.task].state(), TaskState::Skipped);
    assert_eq!(job.state, JobState::Done);
}

#[tokio::test]
async fn test_restart_running_task_overrides_late_report() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("j", "alice", 1)).await;
    farm.add_renders(&["r1", "r2"]).await;
    let exec = farm.offer("r1", t0()).await.unwrap();

    let restart = Event::AdminRestart(RestartRequest {
        tasks: TasksPos {
            job_id,
            block: 0,
            tasks: vec![0],
        },
        reset_errors: false,
    });
    assert!(matches!(
        farm.scheduler.handle(restart, at(1)).await,
        Response::Stop { .. }
    ));

    // The old execution finishing afterwards does not complete the task.
    farm.finish(&exec, at(2)).await;
    let job = farm.scheduler.job_snapshot(job_id).await.unwrap();
    assert_eq!(job.blocks[0].tasks[0].state(), TaskState::Ready);

    let again = farm.offer("r2", at(3)).await.unwrap();
    assert_eq!(again.task, 0);
}

#[tokio::test]
async fn test_listeners_get_output_and_terminal_state() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("j", "alice", 1)).await;
    farm.add_renders(&["r1"]).await;
    let mut notices = farm.scheduler.subscribe_notices();

    let listen = Event::ListenRequest(ListenRequest {
        job_id,
        block: 0,
        task: 0,
        address: "monitor:9000".to_string(),
        subscribe: true,
    });
    assert_eq!(farm.scheduler.handle(listen, t0()).await, Response::Ack);

    let exec = farm.offer("r1", t0()).await.unwrap();
    farm.scheduler
        .update_task_state(
            &TaskReport::new(&exec, ReportStatus::Running).with_output("Fra:1 Mem:12M"),
            at(1),
        )
        .await
        .unwrap();
    farm.finish(&exec, at(2)).await;

    let output = notices.recv().await.unwrap();
    assert_eq!(output.address, "monitor:9000");
    assert_eq!(output.output.as_deref(), Some("Fra:1 Mem:12M"));
    assert_eq!(output.state, None);

    let done = notices.recv().await.unwrap();
    assert_eq!(done.pos.job_id, job_id);
    assert_eq!(done.state, Some(TaskState::Done));

    let job = farm.scheduler.job_snapshot(job_id).await.unwrap();
    assert!(job.blocks[0].tasks[0].listeners.is_empty());
    assert!(notices.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribed_listener_gets_nothing() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("j", "alice", 1)).await;
    farm.add_renders(&["r1"]).await;
    let mut notices = farm.scheduler.subscribe_notices();

    for subscribe in [true, false] {
        let req = ListenRequest {
            job_id,
            block: 0,
            task: 0,
            address: "monitor:9000".to_string(),
            subscribe,
        };
        farm.scheduler.listen(&req).await.unwrap();
    }

    let exec = farm.offer("r1", t0()).await.unwrap();
    farm.finish(&exec, at(1)).await;
    assert!(notices.try_recv().is_err());
}

#[tokio::test]
async fn test_task_log_survives_job_removal() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("j", "alice", 1)).await;
    farm.add_renders(&["r1"]).await;
    let exec = farm.offer("r1", t0()).await.unwrap();
    farm.finish(&exec, at(1)).await;

    let pos = exec.pos();
    let live = farm.scheduler.task_log(pos).await.unwrap();
    assert!(live.iter().any(|l| l.contains("Started on r1")));
    assert!(live.iter().any(|l| l.contains("Done on r1")));

    farm.scheduler.skip_job(job_id, at(2)).await.unwrap();
    let stored = {
        use renderq::store::Store;
        farm.store.load_task_log(pos).await.unwrap().unwrap()
    };
    assert_eq!(stored, live);

    farm.scheduler.delete_job(job_id, at(3)).await.unwrap();
    assert!(farm.scheduler.task_log(pos).await.is_err());
}

#[tokio::test]
async fn test_offer_from_render_that_lost_its_task() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("j", "alice", 1)).await;
    farm.add_renders(&["r1"]).await;
    let lost = farm.offer("r1", t0()).await.unwrap();

    // The render restarted and offers itself again without reporting.
    let exec = match farm.scheduler.handle(worker_offer("r1"), at(5)).await {
        Response::Dispatch(exec) => exec,
        other => panic!("expected dispatch, got {:?}", other),
    };
    assert_eq!(exec.pos(), lost.pos());
    assert_ne!(exec.exec_id, lost.exec_id);

    let job = farm.scheduler.job_snapshot(job_id).await.unwrap();
    assert_eq!(job.blocks[0].tasks[0].progress.errors_count, 1);
    assert_eq!(job.blocks[0].tasks[0].error_hosts.count("r1"), 1);
    let render = farm.scheduler.render("r1").await.unwrap();
    assert_eq!(render.tasks_failed, 1);
    assert_eq!(render.current.map(|a| a.exec_id), Some(exec.exec_id));

    let late = farm
        .scheduler
        .update_task_state(&TaskReport::new(&lost, ReportStatus::Done), at(6))
        .await
        .unwrap();
    assert!(late.ignored);
    assert_eq!(farm.scheduler.user("alice").await.unwrap().running_tasks_num, 1);
}
