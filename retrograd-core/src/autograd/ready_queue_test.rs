use super::*;
use crate::autograd::graph_task::GraphTask;
use std::sync::Arc;
use std::time::Duration;

fn graph_task_with_depth(depth: usize) -> Arc<GraphTask> {
    Arc::new(GraphTask::new(
        false,
        false,
        false,
        depth,
        Arc::new(ReadyQueue::new()),
    ))
}

#[test]
fn test_push_increments_outstanding() {
    let queue = ReadyQueue::new();
    let graph_task = graph_task_with_depth(0);

    queue.push(
        NodeTask::new(Arc::downgrade(&graph_task), None, InputBuffer::new(0)),
        true,
    );
    assert_eq!(graph_task.outstanding_tasks.load(Ordering::SeqCst), 1);

    queue.push(
        NodeTask::new(Arc::downgrade(&graph_task), None, InputBuffer::new(0)),
        false,
    );
    assert_eq!(graph_task.outstanding_tasks.load(Ordering::SeqCst), 1);
    assert_eq!(queue.len(), 2);
}

#[test]
fn test_pop_prefers_shutdown_then_depth() {
    let queue = ReadyQueue::new();
    let shallow = graph_task_with_depth(1);
    let deep = graph_task_with_depth(5);

    queue.push(
        NodeTask::new(Arc::downgrade(&shallow), None, InputBuffer::new(0)),
        true,
    );
    queue.push(
        NodeTask::new(Arc::downgrade(&deep), None, InputBuffer::new(0)),
        true,
    );
    queue.push_shutdown();

    let first = queue.pop();
    assert!(first.is_shutdown());
    let second = queue.pop();
    assert_eq!(second.reentrant_depth, 5);
    let third = queue.pop();
    assert_eq!(third.reentrant_depth, 1);
}

#[test]
fn test_unordered_within_a_depth() {
    // Arrival order within one reentrant depth is unspecified; all we may
    // assert is that every task comes back out.
    let queue = ReadyQueue::new();
    let graph_task = graph_task_with_depth(2);
    for _ in 0..4 {
        queue.push(
            NodeTask::new(Arc::downgrade(&graph_task), None, InputBuffer::new(0)),
            true,
        );
    }
    let mut seen = 0;
    while !queue.is_empty() {
        let task = queue.pop();
        assert_eq!(task.reentrant_depth, 2);
        seen += 1;
    }
    assert_eq!(seen, 4);
}

#[test]
fn test_expired_graph_task_push_is_dropped() {
    let queue = ReadyQueue::new();
    let graph_task = graph_task_with_depth(0);
    let weak = Arc::downgrade(&graph_task);
    drop(graph_task);

    queue.push(NodeTask::new(weak, None, InputBuffer::new(0)), true);
    assert!(queue.is_empty());
}

#[test]
fn test_pop_blocks_until_push() {
    let queue = Arc::new(ReadyQueue::new());
    let graph_task = graph_task_with_depth(0);

    let popper = {
        let queue = Arc::clone(&queue);
        std::thread::spawn(move || queue.pop().is_shutdown())
    };
    // Give the popper a moment to park on the condvar.
    std::thread::sleep(Duration::from_millis(20));
    queue.push_shutdown();
    assert!(popper.join().unwrap());
    drop(graph_task);
}
