//! Integration test: message sink state, history and callbacks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use vklayer_core::{Diagnostic, DiagnosticCode, MessageSink, ObjectType, ReportFlags};

fn diag(flags: ReportFlags, message: &str) -> Diagnostic {
    Diagnostic::new(
        flags,
        DiagnosticCode::InvalidObject,
        ObjectType::Image,
        0x2000,
        "vkTest",
        message,
    )
}

#[test]
fn test_latest_error_is_visible() {
    let sink = MessageSink::new();
    sink.report(diag(ReportFlags::ERROR, "first"));
    sink.report(diag(ReportFlags::WARN, "second"));

    let (flags, message) = sink.state();
    assert_eq!(flags, ReportFlags::WARN);
    assert_eq!(message, "second");
    assert_eq!(sink.error_count(), 1);
}

#[test]
fn test_info_does_not_replace_latest() {
    let sink = MessageSink::new();
    sink.report(diag(ReportFlags::ERROR, "an error"));
    sink.report(diag(ReportFlags::INFO, "chatter"));

    assert_eq!(sink.last_flags(), ReportFlags::ERROR);
    assert_eq!(sink.last_message(), "an error");
}

#[test]
fn test_clear_state_is_idempotent() {
    let sink = MessageSink::new();
    sink.report(diag(ReportFlags::ERROR, "boom"));

    sink.clear_state();
    sink.clear_state();
    let (flags, message) = sink.state();
    assert_eq!(flags, ReportFlags::INFO);
    assert!(message.is_empty());
}

#[test]
fn test_independent_sinks_do_not_share_state() {
    let a = MessageSink::new();
    let b = MessageSink::new();
    a.report(diag(ReportFlags::ERROR, "only in a"));

    assert_eq!(a.last_message(), "only in a");
    assert_eq!(b.last_flags(), ReportFlags::INFO);
    assert!(b.last_message().is_empty());
}

#[test]
fn test_bailout_raised_on_error_only() {
    let sink = MessageSink::new();
    let bailout = Arc::new(AtomicBool::new(false));
    sink.set_bailout(bailout.clone());

    sink.report(diag(ReportFlags::WARN, "just a warning"));
    assert!(!bailout.load(Ordering::SeqCst));

    sink.report(diag(ReportFlags::ERROR, "stop"));
    assert!(bailout.load(Ordering::SeqCst));
}

#[test]
fn test_cleared_bailout_is_left_alone() {
    let sink = MessageSink::new();
    let bailout = Arc::new(AtomicBool::new(false));
    sink.set_bailout(bailout.clone());
    sink.clear_bailout();

    sink.report(diag(ReportFlags::ERROR, "after clear"));
    assert!(!bailout.load(Ordering::SeqCst));
    assert_eq!(sink.error_count(), 1);
}

#[test]
fn test_callbacks_receive_every_report() {
    let sink = MessageSink::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let id = sink.register_callback(move |d| {
        assert_eq!(d.layer_prefix, "OBJTRACK");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    sink.report(diag(ReportFlags::INFO, "a"));
    sink.report(diag(ReportFlags::ERROR, "b"));
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    assert!(sink.unregister_callback(id));
    sink.report(diag(ReportFlags::ERROR, "c"));
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[test]
fn test_history_is_bounded() {
    let sink = MessageSink::with_history_limit(2);
    sink.report(diag(ReportFlags::WARN, "one"));
    sink.report(diag(ReportFlags::WARN, "two"));
    sink.report(diag(ReportFlags::WARN, "three"));

    let drained: Vec<String> = sink.drain().into_iter().map(|d| d.message).collect();
    assert_eq!(drained, vec!["two".to_string(), "three".to_string()]);
    assert!(sink.drain().is_empty());
}
