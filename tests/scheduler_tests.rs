//! Dispatch tests: ceilings, ordering, matching and block order.


use renderq::error::SchedulerError;
use renderq::protocol::{ReportStatus, TaskReport};
use renderq::scheduler::{
    BlockOrder, BlockSpec, JobSpec, JobState, RenderProfile, RenderState, TaskState,
};
use test_harness::{at, job_spec, t0, TestFarm, SERVICE};

#[tokio::test]
async fn test_job_ceiling_limits_simultaneous_offers() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("j1", "alice", 3).with_max_running(2)).await;
    farm.add_renders(&["r1", "r2", "r3"]).await;

    let mut dispatched = 0;
    for render in ["r1", "r2", "r3"] {
        if farm.offer(render, t0()).await.is_some() {
            dispatched += 1;
        }
    }
    assert_eq!(dispatched, 2);

    let job = farm.scheduler.job_snapshot(job_id).await.unwrap();
    assert_eq!(job.counters.running, 2);
    assert_eq!(job.counters.ready, 1);
    assert_eq!(job.state, JobState::Running);
    assert!(farm.scheduler.render("r3").await.unwrap().is_idle());
}

#[tokio::test]
async fn test_concurrent_offers_respect_ceilings() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("j1", "alice", 10).with_max_running(3)).await;
    let names: Vec<String> = (0..8).map(|i| format!("r{}", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    farm.add_renders(&refs).await;

    let mut handles = Vec::new();
    for name in names.clone() {
        let scheduler = farm.scheduler.clone();
        handles.push(tokio::spawn(async move { scheduler.solve(&name, t0()).await }));
    }
    let mut dispatched = 0;
    for h in handles {
        if h.await.unwrap().unwrap().is_some() {
            dispatched += 1;
        }
    }
    assert_eq!(dispatched, 3);
    assert_eq!(farm.scheduler.job_snapshot(job_id).await.unwrap().running(), 3);
    assert_eq!(farm.scheduler.user("alice").await.unwrap().running_tasks_num, 3);
}

#[tokio::test]
async fn test_user_ceiling_spans_jobs() {
    let farm = TestFarm::new();
    farm.add_job(job_spec("a", "alice", 2)).await;
    farm.add_job(job_spec("b", "alice", 2)).await;
    farm.scheduler
        .set_user_max_running("alice", Some(3))
        .await
        .unwrap();
    farm.add_renders(&["r1", "r2", "r3", "r4"]).await;

    let mut execs = Vec::new();
    for render in ["r1", "r2", "r3", "r4"] {
        if let Some(exec) = farm.offer(render, t0()).await {
            execs.push(exec);
        }
    }
    assert_eq!(execs.len(), 3);
    assert_eq!(farm.scheduler.user("alice").await.unwrap().running_tasks_num, 3);

    // Finishing one frees a slot for the idle render.
    farm.finish(&execs[0], at(10)).await;
    assert_eq!(farm.scheduler.user("alice").await.unwrap().running_tasks_num, 2);
    assert!(farm.offer("r4", at(11)).await.is_some());
}

#[tokio::test]
async fn test_user_priority_before_job_priority_before_id() {
    let farm = TestFarm::new();
    let low_user = farm.add_job(job_spec("low-user", "bob", 1).with_priority(250)).await;
    let high_first = farm.add_job(job_spec("high-a", "alice", 1).with_priority(50)).await;
    let high_second = farm.add_job(job_spec("high-b", "alice", 1).with_priority(50)).await;
    let high_top = farm.add_job(job_spec("high-c", "alice", 1).with_priority(60)).await;
    farm.scheduler.set_user_priority("alice", 200).await.unwrap();
    farm.scheduler.set_user_priority("bob", 10).await.unwrap();
    farm.add_renders(&["r1", "r2", "r3", "r4"]).await;

    let order: Vec<_> = {
        let mut order = Vec::new();
        for render in ["r1", "r2", "r3", "r4"] {
            order.push(farm.offer(render, t0()).await.unwrap().job_id);
        }
        order
    };
    assert_eq!(order, vec![high_top, high_first, high_second, low_user]);
}

#[tokio::test]
async fn test_dispatch_is_deterministic() {
    async fn picks() -> Vec<(u64, usize, usize)> {
        let farm = TestFarm::new();
        farm.add_job(job_spec("a", "alice", 3)).await;
        farm.add_job(job_spec("b", "bob", 2).with_priority(120)).await;
        farm.add_renders(&["r1", "r2", "r3", "r4"]).await;
        let mut picks = Vec::new();
        for render in ["r1", "r2", "r3", "r4"] {
            let exec = farm.offer(render, t0()).await.unwrap();
            picks.push((exec.job_id, exec.block, exec.task));
        }
        picks
    }

    let first = picks().await;
    assert_eq!(first, picks().await);
    assert_eq!(first[0], (2, 0, 0));
    assert_eq!(first[1], (2, 0, 1));
    assert_eq!(first[2], (1, 0, 0));
}

#[tokio::test]
async fn test_restart_gives_same_pick_again() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("a", "alice", 4)).await;
    farm.add_renders(&["r1"]).await;

    let first = farm.offer("r1", t0()).await.unwrap();
    let stops = farm
        .scheduler
        .restart_tasks(
            &renderq::protocol::TasksPos {
                job_id,
                block: 0,
                tasks: vec![first.task],
            },
            false,
            at(1),
        )
        .await
        .unwrap();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].render, "r1");

    let second = farm.offer("r1", at(2)).await.unwrap();
    assert_eq!((first.job_id, first.block, first.task), (second.job_id, second.block, second.task));
    assert_ne!(first.exec_id, second.exec_id);
}

#[tokio::test]
async fn test_busy_render_gets_no_second_task() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("a", "alice", 3)).await;
    farm.add_renders(&["r1"]).await;

    let exec = farm.offer("r1", t0()).await.unwrap();
    assert!(farm.offer("r1", t0()).await.is_none());

    let render = farm.scheduler.render("r1").await.unwrap();
    assert_eq!(render.state, RenderState::Busy);
    assert_eq!(render.current.unwrap().exec_id, exec.exec_id);

    let job = farm.scheduler.job_snapshot(job_id).await.unwrap();
    let task = &job.blocks[0].tasks[exec.task];
    assert_eq!(task.state(), TaskState::Running);
    assert_eq!(task.progress.host.as_deref(), Some("r1"));
}

#[tokio::test]
async fn test_sequential_blocks_wait_for_predecessors() {
    let farm = TestFarm::new();
    let spec = JobSpec::new("seq", "alice", BlockOrder::Sequential)
        .with_block(BlockSpec::explicit("sim", SERVICE, "sim %1", &["a", "b"]))
        .with_block(BlockSpec::explicit("render", SERVICE, "render %1", &["c"]));
    let job_id = farm.add_job(spec).await;
    farm.add_renders(&["r1", "r2", "r3"]).await;

    let first = farm.offer("r1", t0()).await.unwrap();
    let second = farm.offer("r2", t0()).await.unwrap();
    assert_eq!((first.block, second.block), (0, 0));
    assert!(farm.offer("r3", t0()).await.is_none());

    let job = farm.scheduler.job_snapshot(job_id).await.unwrap();
    assert_eq!(job.blocks[1].tasks[0].state(), TaskState::Waiting);

    farm.finish(&first, at(5)).await;
    assert!(farm.offer("r3", at(5)).await.is_none());
    farm.finish(&second, at(6)).await;

    let third = farm.offer("r3", at(7)).await.unwrap();
    assert_eq!((third.block, third.task), (1, 0));
    assert_eq!(third.command, "render c");
}

#[tokio::test]
async fn test_parallel_blocks_dispatch_side_by_side() {
    let farm = TestFarm::new();
    let spec = JobSpec::new("par", "alice", BlockOrder::Parallel)
        .with_block(BlockSpec::explicit("a", SERVICE, "a", &["x"]).with_max_running(1))
        .with_block(BlockSpec::explicit("b", SERVICE, "b", &["y"]));
    farm.add_job(spec).await;
    farm.add_renders(&["r1", "r2"]).await;

    assert_eq!(farm.offer("r1", t0()).await.unwrap().block, 0);
    assert_eq!(farm.offer("r2", t0()).await.unwrap().block, 1);
}

#[tokio::test]
async fn test_block_ceiling() {
    let farm = TestFarm::new();
    let spec = JobSpec::new("j", "alice", BlockOrder::Parallel).with_block(
        BlockSpec::explicit("main", SERVICE, "run %1", &["a", "b", "c"]).with_max_running(1),
    );
    farm.add_job(spec).await;
    farm.add_renders(&["r1", "r2"]).await;

    assert!(farm.offer("r1", t0()).await.is_some());
    assert!(farm.offer("r2", t0()).await.is_none());
}

#[tokio::test]
async fn test_capability_and_memory_matching() {
    let farm = TestFarm::new();
    let spec = JobSpec::new("comp", "alice", BlockOrder::Parallel)
        .with_block(BlockSpec::explicit("nuke", "nuke", "nuke %1", &["shot"]).with_memory(8192));
    farm.add_job(spec).await;

    farm.add_render(RenderProfile::new("blender-only", "10.0.0.1:1").with_capability(SERVICE))
        .await;
    farm.add_render(
        RenderProfile::new("small", "10.0.0.2:1")
            .with_capability("nuke")
            .with_memory(4096),
    )
    .await;
    farm.add_render(
        RenderProfile::new("big", "10.0.0.3:1")
            .with_capability("nuke")
            .with_memory(16384),
    )
    .await;

    assert!(farm.offer("blender-only", t0()).await.is_none());
    assert!(farm.offer("small", t0()).await.is_none());
    let exec = farm.offer("big", t0()).await.unwrap();
    assert_eq!(exec.needs_memory_mb, Some(8192));
    assert_eq!(exec.service, "nuke");
}

#[tokio::test]
async fn test_job_and_user_host_masks() {
    let farm = TestFarm::new();
    farm.add_job(job_spec("masked", "alice", 3).with_hosts_mask("farm0[1-2]", "farm02"))
        .await;
    farm.add_renders(&["farm01", "farm02", "farm03"]).await;

    assert!(farm.offer("farm02", t0()).await.is_none());
    assert!(farm.offer("farm03", t0()).await.is_none());
    assert!(farm.offer("farm01", t0()).await.is_some());

    farm.add_job(job_spec("other", "bob", 1)).await;
    farm.scheduler
        .set_user_hosts_mask("bob", "farm03", "")
        .await
        .unwrap();
    assert!(farm.offer("farm02", t0()).await.is_none());
    assert!(farm.offer("farm03", t0()).await.is_some());
}

#[tokio::test]
async fn test_numeric_block_command() {
    let farm = TestFarm::new();
    let spec = JobSpec::new("frames", "alice", BlockOrder::Parallel).with_block(
        BlockSpec::numeric("beauty", SERVICE, "blender -b s.blend -s @####@ -e @####@", 1, 10, 5),
    );
    farm.add_job(spec).await;
    farm.add_renders(&["r1", "r2", "r3"]).await;

    let first = farm.offer("r1", t0()).await.unwrap();
    let second = farm.offer("r2", t0()).await.unwrap();
    assert_eq!(first.command, "blender -b s.blend -s 0001 -e 0005");
    assert_eq!(second.frames, Some((6, 10)));
    assert_eq!(second.task_name, "frames 6-10");
    assert!(farm.offer("r3", t0()).await.is_none());
}

#[tokio::test]
async fn test_progress_and_completion() {
    let farm = TestFarm::new();
    let job_id = farm.add_job(job_spec("j", "alice", 2)).await;
    farm.add_renders(&["r1", "r2"]).await;

    let a = farm.offer("r1", t0()).await.unwrap();
    let b = farm.offer("r2", t0()).await.unwrap();
    farm.scheduler
        .update_task_state(
            &TaskReport::new(&a, ReportStatus::Running).with_progress(50, "sampling"),
            at(1),
        )
        .await
        .unwrap();
    let job = farm.scheduler.job_snapshot(job_id).await.unwrap();
    assert_eq!(job.blocks[0].tasks[a.task].progress.activity, "sampling");
    assert_eq!(job.counters.percent, 25);

    farm.finish(&a, at(2)).await;
    farm.finish(&b, at(3)).await;
    let job = farm.scheduler.job_snapshot(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.counters.percent, 100);
    assert_eq!(job.time_done, Some(at(3)));
    assert_eq!(farm.scheduler.render("r1").await.unwrap().tasks_done, 1);
    assert_eq!(farm.scheduler.user("alice").await.unwrap().running_tasks_num, 0);
}

#[tokio::test]
async fn test_unknown_render_and_bad_job() {
    let farm = TestFarm::new();
    assert!(matches!(
        farm.scheduler.solve("ghost", t0()).await,
        Err(SchedulerError::RenderNotFound(_))
    ));

    let empty = JobSpec::new("empty", "alice", BlockOrder::Parallel);
    assert!(matches!(
        farm.scheduler.add_job(empty, t0()).await,
        Err(SchedulerError::InvalidJob(_))
    ));
    let bad_mask = job_spec("bad", "alice", 1).with_hosts_mask("farm[", "");
    assert!(matches!(
        farm.scheduler.add_job(bad_mask, t0()).await,
        Err(SchedulerError::InvalidHostMask(_))
    ));
    assert!(farm.scheduler.job_summaries().await.is_empty());
}
