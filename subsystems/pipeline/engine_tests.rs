//! # Pipeline Scenario Tests
//!
//! End-to-end exercises of the submission/completion engine against the
//! stub board: the direct-lookup completion path, stale-tag handling,
//! lockup force-fail, both abort tiers, retry backoff, and the performant
//! reply-ring transport.

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    use ciss_command::block::hwstat;
    use ciss_command::{
        allocate_blocking, CommandKind, CompletionHook, CompletionStatus, ControllerId, ErrorInfo,
        PoolConfig, RequestInfo, Tag, Waiter,
    };
    use ciss_hal::board::StubBoard;
    use ciss_hal::dma::DmaBuffer;
    use ciss_hal::{regs, BusAddr, Nanoseconds, RegisterWindow};

    use crate::abort::{AbortConfig, AbortEncoding, AbortOutcome};
    use crate::engine::{Pipeline, PipelineConfig, TransportMode};
    use crate::PipelineError;

    type StatusLog = Arc<Mutex<Vec<CompletionStatus>>>;

    fn status_log() -> StatusLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn record_into(log: &StatusLog) -> CompletionHook {
        let log = log.clone();
        CompletionHook::Callback(Box::new(move |status| log.lock().push(status)))
    }

    fn read10() -> RequestInfo {
        let mut req = RequestInfo::default();
        req.cdb[0] = 0x28;
        req.cdb_len = 10;
        req
    }

    fn simple(board: &StubBoard) -> Pipeline {
        Pipeline::new(board, ControllerId::new(1), TransportMode::Simple, PipelineConfig::default())
            .unwrap()
    }

    /// Submit one SCSI command, returning its tag and its DMA region (for
    /// scripting firmware-side error records).
    fn submit_one(p: &Pipeline, board: &StubBoard, log: &StatusLog) -> (Tag, DmaBuffer) {
        let mut block = p.allocate(CommandKind::Scsi).unwrap();
        block.prepare(CommandKind::Scsi, read10(), record_into(log));
        let tag = block.tag();
        let region = block.region().clone();
        p.enqueue_and_start(block, board).unwrap();
        (tag, region)
    }

    // =========================================================================
    // Submission and direct-lookup completion
    // =========================================================================

    #[test]
    fn test_submit_complete_release_cycle() {
        let board = StubBoard::new();
        let p = simple(&board);
        let log = status_log();

        let (tag, _) = submit_one(&p, &board, &log);
        assert_eq!(board.posted(), alloc::vec![tag.raw()]);
        assert_eq!(p.in_flight_len(), 1);
        assert_eq!(p.outstanding(), 1);

        board.push_completion(tag.raw());
        assert_eq!(p.process_completions(&board, Nanoseconds::ZERO), 1);

        // Exactly one callback, success, and the slot is free again.
        assert_eq!(&*log.lock(), &[CompletionStatus::Success]);
        assert_eq!(p.outstanding(), 0);
        assert_eq!(p.in_flight_len(), 0);

        let depth = p.usable_depth();
        let mut held = Vec::new();
        for _ in 0..depth {
            held.push(p.allocate(CommandKind::Scsi).unwrap());
        }
        for b in held {
            p.give_back(b);
        }
    }

    #[test]
    fn test_errored_completion_translates_record() {
        let board = StubBoard::new();
        let p = simple(&board);
        let log = status_log();

        let (tag, region) = submit_one(&p, &board, &log);
        let record = ErrorInfo {
            hw_status: hwstat::DATA_UNDERRUN,
            residual: 2048,
            ..Default::default()
        };
        record.write_to(&region);

        // Error bit set in the completed tag makes the driver read the record.
        board.push_completion(tag.raw() | 0b10);
        p.process_completions(&board, Nanoseconds::ZERO);
        assert_eq!(&*log.lock(), &[CompletionStatus::Underrun { residual: 2048 }]);
    }

    #[test]
    fn test_fifo_full_backpressure() {
        let board = StubBoard::new();
        let p = simple(&board);
        let log = status_log();

        board.set_fifo_full(true);
        let mut block = p.allocate(CommandKind::Scsi).unwrap();
        block.prepare(CommandKind::Scsi, read10(), record_into(&log));
        p.enqueue_and_start(block, &board).unwrap();

        // Held on the software list while hardware reports full.
        assert_eq!(p.ready_len(), 1);
        assert!(board.posted().is_empty());

        board.set_fifo_full(false);
        p.drain(&board);
        assert_eq!(p.ready_len(), 0);
        assert_eq!(board.posted().len(), 1);
    }

    #[test]
    fn test_outstanding_budget_yields_busy() {
        let board = StubBoard::new();
        let p = Pipeline::new(
            &board,
            ControllerId::new(1),
            TransportMode::Simple,
            PipelineConfig {
                pool: PoolConfig { total_slots: 2, reserved_slots: 1, ..Default::default() },
                ..Default::default()
            },
        )
        .unwrap();
        let log = status_log();

        let mut a = p.allocate(CommandKind::Scsi).unwrap();
        a.prepare(CommandKind::Scsi, read10(), record_into(&log));
        p.enqueue_and_start(a, &board).unwrap();
        let mut b = p.allocate(CommandKind::Internal).unwrap();
        b.prepare(CommandKind::Internal, read10(), CompletionHook::None);
        p.enqueue_and_start(b, &board).unwrap();

        // Hardware budget (2 slots) consumed; a blocking-path command must
        // see busy rather than overrun the FIFO.
        let mut c = allocate_blocking(&board, ControllerId::new(1)).unwrap();
        c.prepare(CommandKind::Management, read10(), CompletionHook::None);
        assert_eq!(p.enqueue_and_start(c, &board).unwrap_err(), PipelineError::Busy);
    }

    // =========================================================================
    // Stale and malformed completions
    // =========================================================================

    #[test]
    fn test_out_of_range_slot_discarded() {
        let board = StubBoard::new();
        let p = simple(&board);
        let log = status_log();
        let (tag, _) = submit_one(&p, &board, &log);

        board.push_completion(Tag::for_slot(999).raw());
        p.process_completions(&board, Nanoseconds::ZERO);

        // Dropped without touching the live command.
        assert_eq!(p.stats().snapshot().stale_tags_dropped, 1);
        assert!(p.in_flight_contains(tag));
        assert!(log.lock().is_empty());

        board.push_completion(tag.raw());
        p.process_completions(&board, Nanoseconds::ZERO);
        assert_eq!(&*log.lock(), &[CompletionStatus::Success]);
    }

    #[test]
    fn test_unmatched_scan_tag_discarded() {
        let board = StubBoard::new();
        let p = simple(&board);
        // Non-direct value that matches no in-flight command.
        board.push_completion(0x00F0_0000);
        p.process_completions(&board, Nanoseconds::ZERO);
        assert_eq!(p.stats().snapshot().stale_tags_dropped, 1);
    }

    // =========================================================================
    // Lockup force-fail
    // =========================================================================

    #[test]
    fn test_force_fail_completes_everything_exactly_once() {
        let board = StubBoard::new();
        let p = simple(&board);
        let log = status_log();

        // Two in flight, one stuck on the ready list behind a full FIFO.
        submit_one(&p, &board, &log);
        submit_one(&p, &board, &log);
        board.set_fifo_full(true);
        let mut block = p.allocate(CommandKind::Scsi).unwrap();
        block.prepare(CommandKind::Scsi, read10(), record_into(&log));
        p.enqueue_and_start(block, &board).unwrap();

        let posted_before = board.posted().len();
        assert_eq!(p.force_fail_all(), 3);

        let statuses = log.lock();
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| *s == CompletionStatus::HardwareError));
        drop(statuses);

        assert_eq!(p.outstanding(), 0);
        assert_eq!(p.ready_len() + p.in_flight_len() + p.deferred_len(), 0);
        // No further hardware submission attempts.
        assert_eq!(board.posted().len(), posted_before);

        // Subsequent submissions fail immediately, still with exactly one
        // callback each.
        let mut late = p.allocate(CommandKind::Scsi).unwrap();
        late.prepare(CommandKind::Scsi, read10(), record_into(&log));
        assert_eq!(p.enqueue_and_start(late, &board).unwrap_err(), PipelineError::NotAccepting);
        assert_eq!(log.lock().last(), Some(&CompletionStatus::HardwareError));
    }

    #[test]
    fn test_force_fail_twice_is_idempotent() {
        let board = StubBoard::new();
        let p = simple(&board);
        let log = status_log();
        submit_one(&p, &board, &log);
        assert_eq!(p.force_fail_all(), 1);
        assert_eq!(p.force_fail_all(), 0);
        assert_eq!(log.lock().len(), 1);
    }

    // =========================================================================
    // Abort
    // =========================================================================

    #[test]
    fn test_abort_unsubmitted_never_touches_hardware() {
        let board = StubBoard::new();
        let p = simple(&board);
        let log = status_log();

        board.set_fifo_full(true);
        let mut block = p.allocate(CommandKind::Scsi).unwrap();
        block.prepare(CommandKind::Scsi, read10(), record_into(&log));
        let tag = block.tag();
        p.enqueue_and_start(block, &board).unwrap();

        let outcome =
            p.abort(tag, AbortEncoding::Both, AbortConfig::default(), &board, &board);
        assert_eq!(outcome, AbortOutcome::Success);
        assert_eq!(&*log.lock(), &[CompletionStatus::Aborted]);
        // No abort message, no post: hardware never heard of it.
        assert!(board.abort_requests().is_empty());
        assert!(board.posted().is_empty());
        assert_eq!(p.outstanding(), 0);
    }

    #[test]
    fn test_abort_in_flight_polls_until_victim_leaves() {
        let board = StubBoard::new();
        let p = simple(&board);
        let log = status_log();
        let (tag, _) = submit_one(&p, &board, &log);

        // Firmware will answer the abort by completing the victim.
        board.push_completion(tag.raw());
        let outcome =
            p.abort(tag, AbortEncoding::Native, AbortConfig::default(), &board, &board);
        assert_eq!(outcome, AbortOutcome::Success);
        assert_eq!(board.abort_requests(), alloc::vec![tag.raw()]);
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_abort_failure_after_budget() {
        let board = StubBoard::new();
        let p = simple(&board);
        let log = status_log();
        let (tag, _) = submit_one(&p, &board, &log);

        let config = AbortConfig { attempts: 3, poll_ms: 10 };
        let outcome = p.abort(tag, AbortEncoding::Both, config, &board, &board);
        assert_eq!(outcome, AbortOutcome::Failed);
        // Both encodings were offered to firmware.
        assert_eq!(board.abort_requests(), alloc::vec![tag.raw(), tag.swapped()]);
        assert_eq!(p.stats().snapshot().aborts_failed, 1);
        // The victim is still owed a completion.
        assert!(p.in_flight_contains(tag));
    }

    #[test]
    fn test_abort_of_finished_command_succeeds() {
        let board = StubBoard::new();
        let p = simple(&board);
        let log = status_log();
        let (tag, _) = submit_one(&p, &board, &log);
        board.push_completion(tag.raw());
        p.process_completions(&board, Nanoseconds::ZERO);

        let outcome =
            p.abort(tag, AbortEncoding::Native, AbortConfig::default(), &board, &board);
        assert_eq!(outcome, AbortOutcome::Success);
        assert!(board.abort_requests().is_empty());
    }

    // =========================================================================
    // Driver-side retry (unit attention)
    // =========================================================================

    fn unit_attention() -> ErrorInfo {
        let mut sense = [0u8; 32];
        sense[2] = 0x6;
        ErrorInfo {
            hw_status: hwstat::TARGET_STATUS,
            scsi_status: 0x02,
            sense,
            sense_len: 18,
            ..Default::default()
        }
    }

    #[test]
    fn test_unit_attention_retried_with_backoff() {
        let board = StubBoard::new();
        let p = simple(&board);
        let log = status_log();
        let (tag, region) = submit_one(&p, &board, &log);

        unit_attention().write_to(&region);
        board.push_completion(tag.raw() | 0b10);
        p.process_completions(&board, Nanoseconds::ZERO);

        // Parked, not surfaced.
        assert!(log.lock().is_empty());
        assert_eq!(p.deferred_len(), 1);
        assert_eq!(p.stats().snapshot().retries, 1);

        // Backoff not elapsed yet.
        assert_eq!(p.service_deferred(Nanoseconds::from_micros(100), &board), 0);
        // Elapsed: resubmitted.
        assert_eq!(p.service_deferred(Nanoseconds::from_millis(2), &board), 1);
        assert_eq!(board.posted().len(), 2);

        board.push_completion(tag.raw());
        p.process_completions(&board, Nanoseconds::from_millis(3));
        assert_eq!(&*log.lock(), &[CompletionStatus::Success]);
    }

    #[test]
    fn test_retry_budget_exhaustion_surfaces_failure() {
        let board = StubBoard::new();
        let p = Pipeline::new(
            &board,
            ControllerId::new(1),
            TransportMode::Simple,
            PipelineConfig { retry_limit: 1, ..Default::default() },
        )
        .unwrap();
        let log = status_log();
        let (tag, region) = submit_one(&p, &board, &log);

        unit_attention().write_to(&region);
        board.push_completion(tag.raw() | 0b10);
        p.process_completions(&board, Nanoseconds::ZERO);
        assert_eq!(p.service_deferred(Nanoseconds::from_secs(1), &board), 1);

        // Second unit attention exceeds the budget and is surfaced.
        unit_attention().write_to(&region);
        board.push_completion(tag.raw() | 0b10);
        p.process_completions(&board, Nanoseconds::from_secs(2));
        let statuses = log.lock();
        assert_eq!(statuses.len(), 1);
        assert!(matches!(statuses[0], CompletionStatus::TargetStatus { .. }));
    }

    // =========================================================================
    // Performant transport
    // =========================================================================

    fn performant(board: &StubBoard) -> Pipeline {
        Pipeline::new(
            board,
            ControllerId::new(2),
            TransportMode::Performant,
            PipelineConfig { ring_count: 2, ring_depth: 4, ..Default::default() },
        )
        .unwrap()
    }

    #[test]
    fn test_performant_tag_freight() {
        let board = StubBoard::new();
        let p = performant(&board);
        let log = status_log();

        let mut block = p.allocate(CommandKind::Scsi).unwrap();
        block.prepare(CommandKind::Scsi, read10(), record_into(&log));
        block
            .build_sg(&[(BusAddr::new(0x8000), 4096), (BusAddr::new(0x9000), 4096)])
            .unwrap();
        block.set_cpu_hint(3);
        p.enqueue_and_start(block, &board).unwrap();

        let posted = Tag::from_raw(board.posted()[0]);
        assert_eq!(posted.sg_count(), 2);
        // cpu 3 over 2 rings lands on ring 1.
        assert_eq!(posted.ring_hint(), 1);
    }

    #[test]
    fn test_performant_ring_completion() {
        let board = StubBoard::new();
        let p = performant(&board);
        let log = status_log();

        let mut block = p.allocate(CommandKind::Scsi).unwrap();
        block.prepare(CommandKind::Scsi, read10(), record_into(&log));
        block.set_cpu_hint(0);
        let tag = block.tag();
        p.enqueue_and_start(block, &board).unwrap();

        // Firmware writes the completion into ring 0 and the driver's
        // consumed index makes it back to hardware.
        let ring0 = p.ring_buffer(0).unwrap();
        crate::rings::ReplyRing::produce(&ring0, 0, tag.raw(), true);
        assert_eq!(p.process_ring(0, &board, Nanoseconds::ZERO).unwrap(), 1);
        assert_eq!(board.read32(regs::REPLY_CONSUMED_BASE), 1);
        assert_eq!(&*log.lock(), &[CompletionStatus::Success]);
    }

    #[test]
    fn test_dynamic_command_resolved_by_scan() {
        let board = StubBoard::new();
        let p = simple(&board);

        let waiter = Waiter::new();
        let mut block = allocate_blocking(&board, ControllerId::new(1)).unwrap();
        block.prepare(
            CommandKind::Management,
            read10(),
            CompletionHook::Parked(waiter.clone()),
        );
        let tag = block.tag();
        assert!(!tag.is_direct());
        p.enqueue_and_start(block, &board).unwrap();

        board.push_completion(tag.raw());
        let status = waiter.wait(5, 1, &board, || {
            p.process_completions(&board, Nanoseconds::ZERO);
        });
        assert_eq!(status, Some(CompletionStatus::Success));
    }
}
