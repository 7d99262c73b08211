/// Batch scenarios for the admission loop
///
/// These drive the whole scheduler against the in-memory runtime with
/// paused time, so a batch of ten-minute runs completes instantly:
/// 1. Owed runs complete and a rebuilt queue is empty
/// 2. Missing images drop work before any sandbox starts
/// 3. Existing completion markers cap what gets dispatched
/// 4. Admission does not wait on in-flight runs
/// 5. Port exhaustion fails the batch
/// 6. Shutdown interrupts in-flight runs and stops admission

#[cfg(test)]
mod scheduler_scenarios {
    use crate::fakes::{run_context, FakeEvent, FakeRuntime, ScriptedHost};
    use crate::lifecycle::RunContext;
    use crate::ports::{PortAllocationExhausted, PortAllocator};
    use crate::queue::{count_completed, WorkQueueBuilder};
    use crate::resources::ResourceMonitor;
    use crate::scheduler::Scheduler;
    use campaign_common::config::CampaignConfig;
    use campaign_common::layout::{pair_dir, COMPLETED_MARKER};
    use campaign_common::types::{PairProgress, WorkUnit};
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const SERVICE_IMAGE: &str = "llamaresttest-svcA";
    const TOOL_IMAGE: &str = "llamaresttest-toolB";
    const PLENTY: u64 = 64 * 1024 * 1024 * 1024;

    fn scheduler(ctx: Arc<RunContext>) -> Scheduler {
        let host = Arc::new(ScriptedHost::always(PLENTY, 0.0, 32));
        let monitor = ResourceMonitor::new(host, ctx.config.gate.clone());
        Scheduler::new(ctx, monitor)
    }

    fn with_services(mut ctx: Arc<RunContext>, services: &[&str]) -> Arc<RunContext> {
        let config = CampaignConfig {
            services: Some(services.iter().map(|s| s.to_string()).collect()),
            ..(*ctx.config).clone()
        };
        Arc::get_mut(&mut ctx).unwrap().config = Arc::new(config);
        ctx
    }

    fn complete_runs(root: &Path, unit: &WorkUnit, count: usize) {
        for i in 0..count {
            let dir = pair_dir(root, &unit.service, &unit.tool).join(format!("run-earlier-{}", i));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(COMPLETED_MARKER), "Run completed.\n").unwrap();
        }
    }

    /// Two owed runs, all steps succeed
    #[tokio::test(start_paused = true)]
    async fn test_batch_completes_owed_runs_and_is_resumable() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::with_images(&[SERVICE_IMAGE, TOOL_IMAGE]));
        let ctx = run_context(root.path(), runtime.clone());
        let unit = WorkUnit::new("svcA", "toolB");

        let summary = scheduler(ctx).execute(2).await.unwrap();

        assert_eq!(summary.planned, 2);
        assert_eq!(summary.launched, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.aborted, 0);
        assert_eq!(count_completed(root.path(), &unit), 2);
        assert!(runtime.running().is_empty());

        let rebuilt = WorkQueueBuilder::new(root.path(), vec!["svcA".into()], vec!["toolB".into()]);
        assert!(rebuilt.build(2).is_empty());
    }

    /// Tool image never built
    #[tokio::test(start_paused = true)]
    async fn test_missing_tool_image_starts_no_sandbox() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::with_images(&[SERVICE_IMAGE]));
        let ctx = run_context(root.path(), runtime.clone());

        let summary = scheduler(ctx).execute(3).await.unwrap();

        assert_eq!(summary.planned, 0);
        assert_eq!(summary.launched, 0);
        assert_eq!(runtime.launches(), 0);
        assert!(runtime.events().is_empty());
        assert!(!pair_dir(root.path(), "svcA", "toolB").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_markers_cap_dispatches() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::with_images(&[SERVICE_IMAGE, TOOL_IMAGE]));
        let ctx = run_context(root.path(), runtime.clone());
        let unit = WorkUnit::new("svcA", "toolB");
        complete_runs(root.path(), &unit, 1);

        let summary = scheduler(ctx).execute(3).await.unwrap();

        assert_eq!(summary.launched, 2);
        assert_eq!(runtime.launch_attempts(SERVICE_IMAGE), 2);
        assert_eq!(count_completed(root.path(), &unit), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_satisfied_batch_dispatches_nothing() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::with_images(&[SERVICE_IMAGE, TOOL_IMAGE]));
        let ctx = run_context(root.path(), runtime.clone());
        complete_runs(root.path(), &WorkUnit::new("svcA", "toolB"), 5);

        let summary = scheduler(ctx).execute(2).await.unwrap();

        assert_eq!(summary.launched, 0);
        assert_eq!(count_completed(root.path(), &WorkUnit::new("svcA", "toolB")), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_overlaps_in_flight_runs() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::with_images(&[SERVICE_IMAGE, TOOL_IMAGE]));
        let ctx = run_context(root.path(), runtime.clone());

        scheduler(ctx).execute(2).await.unwrap();

        // second run's sandboxes start while the first run is still monitoring
        let events = runtime.events();
        assert_eq!(events.len(), 8);
        assert!(events[..4]
            .iter()
            .all(|e| matches!(e, FakeEvent::Launched { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_order_covers_every_pair() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::with_images(&[
            SERVICE_IMAGE,
            "llamaresttest-svcC",
            TOOL_IMAGE,
        ]));
        let ctx = with_services(run_context(root.path(), runtime.clone()), &["svcA", "svcC"]);

        let summary = scheduler(ctx).execute(2).await.unwrap();

        assert_eq!(summary.completed, 4);
        assert_eq!(runtime.launch_attempts(SERVICE_IMAGE), 2);
        assert_eq!(runtime.launch_attempts("llamaresttest-svcC"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_exhaustion_fails_the_batch() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::with_images(&[SERVICE_IMAGE, TOOL_IMAGE]));
        let mut ctx = run_context(root.path(), runtime.clone());
        let exhausted = PortAllocator::with_probe(ctx.config.ports.clone(), |_| false);
        Arc::get_mut(&mut ctx).unwrap().ports = exhausted;
        let shutdown = ctx.shutdown.clone();

        let err = scheduler(ctx).execute(3).await.unwrap_err();

        assert!(err.downcast_ref::<PortAllocationExhausted>().is_some());
        assert!(shutdown.is_cancelled());
        assert!(runtime.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_in_flight_runs() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::with_images(&[SERVICE_IMAGE, TOOL_IMAGE]));
        let ctx = run_context(root.path(), runtime.clone());

        let shutdown = ctx.shutdown.clone();
        tokio::spawn(async move {
            // first run is warming up, second not yet admitted
            tokio::time::sleep(Duration::from_secs(30)).await;
            shutdown.cancel();
        });

        let summary = scheduler(ctx).execute(3).await.unwrap();

        assert_eq!(summary.launched, 1);
        assert_eq!(summary.interrupted, 1);
        assert_eq!(summary.completed, 0);
        assert!(runtime.running().is_empty());
        assert_eq!(count_completed(root.path(), &WorkUnit::new("svcA", "toolB")), 0);
    }

    #[tokio::test]
    async fn test_plan_reports_progress_and_missing_images() {
        let root = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::with_images(&[SERVICE_IMAGE, TOOL_IMAGE]));
        let ctx = with_services(run_context(root.path(), runtime.clone()), &["svcA", "svcC"]);
        complete_runs(root.path(), &WorkUnit::new("svcA", "toolB"), 1);

        let plan = scheduler(ctx).plan(2).await;

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].unit, WorkUnit::new("svcA", "toolB"));
        assert_eq!(plan[0].progress, PairProgress { completed: 1, remaining: 1 });
        assert!(!plan[0].image_missing);
        assert_eq!(plan[1].unit, WorkUnit::new("svcC", "toolB"));
        assert!(plan[1].image_missing);
        assert!(runtime.events().is_empty());
    }
}
