//! Unit tests for the priority admission queue.

use crackq::orchestrator::scheduler::AdmissionQueue;

#[test]
fn higher_priority_is_admitted_first() {
    let mut queue = AdmissionQueue::new();
    queue.push("low".into(), 0);
    queue.push("high".into(), 10);
    queue.push("mid".into(), 5);

    assert_eq!(queue.pop().as_deref(), Some("high"));
    assert_eq!(queue.pop().as_deref(), Some("mid"));
    assert_eq!(queue.pop().as_deref(), Some("low"));
    assert_eq!(queue.pop(), None);
}

#[test]
fn equal_priority_is_fifo() {
    let mut queue = AdmissionQueue::new();
    for id in ["a", "b", "c"] {
        queue.push(id.into(), 1);
    }
    queue.push("urgent".into(), 2);
    queue.push("d".into(), 1);

    let order: Vec<String> = std::iter::from_fn(|| queue.pop()).collect();
    assert_eq!(order, vec!["urgent", "a", "b", "c", "d"]);
}

#[test]
fn negative_priority_runs_last() {
    let mut queue = AdmissionQueue::new();
    queue.push("background".into(), -5);
    queue.push("normal".into(), 0);
    assert_eq!(queue.peek().map(String::as_str), Some("normal"));
}

#[test]
fn duplicate_push_keeps_original_place() {
    let mut queue = AdmissionQueue::new();
    queue.push("a".into(), 0);
    queue.push("b".into(), 0);
    queue.push("a".into(), 99);

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.pop().as_deref(), Some("a"));
}

#[test]
fn remove_and_position() {
    let mut queue = AdmissionQueue::new();
    queue.push("a".into(), 0);
    queue.push("b".into(), 0);
    queue.push("c".into(), 0);

    assert_eq!(queue.position("c"), Some(2));
    assert!(queue.remove("b"));
    assert!(!queue.remove("b"));
    assert_eq!(queue.position("c"), Some(1));
    assert!(!queue.contains("b"));
    assert_eq!(queue.position("b"), None);

    queue.pop();
    queue.pop();
    assert!(queue.is_empty());
}
