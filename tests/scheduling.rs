//! Scheduler scenarios: phase ordering, inline sync effects, coalescing,
//! the update-depth bound and flush entry points.

use filament::{
    effect, flush_now, flush_now_with, managed_effect, pop, pre_effect, push, render_effect,
    set_max_flush_depth, source, sync_effect, tick,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[test]
fn phases_run_in_order_within_one_flush() {
    let order = Rc::new(RefCell::new(Vec::new()));

    let frame = push(None, true, false);

    let o = order.clone();
    let _normal = effect(move || o.borrow_mut().push("effect"));
    let o = order.clone();
    let _pre = pre_effect(move || o.borrow_mut().push("pre"));
    let o = order.clone();
    let _render = render_effect(move |_| o.borrow_mut().push("render"), None);

    pop(None);
    flush_now();

    assert_eq!(*order.borrow(), vec!["pre", "render", "effect"]);
    drop(frame);
}

#[test]
fn sync_effect_from_inside_pre_runs_before_render() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let trigger = source(0);

    let frame = push(None, true, false);

    let o = order.clone();
    let t = trigger.clone();
    let _pre = pre_effect(move || {
        o.borrow_mut().push("pre");
        let _ = t.get();
        // Created inside the pre effect: executes inline, right here
        let o_inner = o.clone();
        let _sync = sync_effect(move || o_inner.borrow_mut().push("sync"));
    });

    let o = order.clone();
    let _render = render_effect(move |_| o.borrow_mut().push("render"), None);

    pop(None);
    flush_now();

    assert_eq!(*order.borrow(), vec!["pre", "sync", "render"]);
    drop(frame);
}

#[test]
fn sync_effect_runs_inline_with_the_write() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let s = source(0);

    let s2 = s.clone();
    let o = order.clone();
    let _sync = {
        let frame = push(None, true, false);
        let e = sync_effect(move || {
            o.borrow_mut().push(s2.get());
        });
        pop(None);
        drop(frame);
        e
    };

    assert_eq!(*order.borrow(), vec![0]);

    s.set(1);
    // No flush: the write itself already ran the effect
    assert_eq!(*order.borrow(), vec![0, 1]);

    s.set(2);
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[test]
fn writes_between_flushes_coalesce() {
    let runs = Rc::new(Cell::new(0));
    let s = source(0);

    let s2 = s.clone();
    let runs2 = runs.clone();
    let _effect = managed_effect(move || {
        let _ = s2.get();
        runs2.set(runs2.get() + 1);
    });
    flush_now();
    assert_eq!(runs.get(), 1);

    // Three writes, one flush, one execution
    s.set(1);
    s.set(2);
    s.set(3);
    flush_now();
    assert_eq!(runs.get(), 2);
    assert_eq!(s.get(), 3);
}

#[test]
fn effects_scheduled_mid_drain_run_in_the_same_flush() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let a = source(0);
    let b = source(0);

    let a2 = a.clone();
    let b2 = b.clone();
    let log2 = log.clone();
    let _writer = managed_effect(move || {
        let v = a2.get();
        log2.borrow_mut().push(format!("writer:{v}"));
        if v == 1 {
            b2.set(1);
        }
    });

    let b3 = b.clone();
    let log3 = log.clone();
    let _reader = managed_effect(move || {
        let v = b3.get();
        log3.borrow_mut().push(format!("reader:{v}"));
    });

    flush_now();
    log.borrow_mut().clear();

    a.set(1);
    flush_now();

    // The reader re-ran inside the same flush that ran the writer
    assert_eq!(*log.borrow(), vec!["writer:1", "reader:1"]);
}

#[test]
fn infinite_update_loop_aborts_with_depth_error() {
    let s = source(0);

    let s2 = s.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        let _effect = managed_effect(move || {
            let current = s2.get();
            s2.set(current + 1);
        });
        flush_now();
    }));

    let err = result.expect_err("self-triggering effect must abort");
    let message = err
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default();
    assert!(
        message.contains("update depth"),
        "panic should name the depth bound, got: {message}"
    );

    // The runtime recovers: a fresh write flushes normally
    let t = source(0);
    let seen = Rc::new(Cell::new(-1));
    let t2 = t.clone();
    let seen2 = seen.clone();
    let _ok = managed_effect(move || seen2.set(t2.get()));
    flush_now();
    t.set(5);
    flush_now();
    assert_eq!(seen.get(), 5);
}

#[test]
fn depth_bound_is_configurable() {
    set_max_flush_depth(10);

    let s = source(0);
    let iterations = Rc::new(Cell::new(0));

    let s2 = s.clone();
    let iterations2 = iterations.clone();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        let _effect = managed_effect(move || {
            iterations2.set(iterations2.get() + 1);
            let current = s2.get();
            s2.set(current + 1);
        });
        flush_now();
    }));

    assert!(result.is_err());
    assert!(
        iterations.get() <= 11,
        "lowered bound must cut the loop short, ran {} times",
        iterations.get()
    );

    set_max_flush_depth(100);
}

#[test]
fn flush_now_with_runs_work_between_drains() {
    let s = source(0);
    let seen = Rc::new(Cell::new(-1));

    let s2 = s.clone();
    let seen2 = seen.clone();
    let _effect = managed_effect(move || seen2.set(s2.get()));
    flush_now();

    let s3 = s.clone();
    let result = flush_now_with(move || {
        s3.set(9);
        "done"
    });

    assert_eq!(result, "done");
    assert_eq!(seen.get(), 9, "writes inside the closure flushed before return");
}

#[test]
fn tick_drains_the_microtask_queue() {
    let s = source(0);
    let seen = Rc::new(Cell::new(-1));

    let s2 = s.clone();
    let seen2 = seen.clone();
    let _effect = managed_effect(move || seen2.set(s2.get()));

    tick();
    assert_eq!(seen.get(), 0);

    s.set(1);
    assert_eq!(seen.get(), 0, "nothing runs before the microtask");
    tick();
    assert_eq!(seen.get(), 1);
}

#[test]
fn pre_effects_settle_per_context_before_render() {
    // Two pre effects of one component where the first dirties the second:
    // the local drain settles both before the component's render effect.
    let order = Rc::new(RefCell::new(Vec::new()));
    let a = source(0);
    let b = source(0);

    let frame = push(None, true, false);

    let o = order.clone();
    let a2 = a.clone();
    let b2 = b.clone();
    let _pre_writer = pre_effect(move || {
        let v = a2.get();
        o.borrow_mut().push(format!("pre_writer:{v}"));
        if v > 0 {
            b2.set(v * 10);
        }
    });

    let o = order.clone();
    let b3 = b.clone();
    let _pre_reader = pre_effect(move || {
        let v = b3.get();
        o.borrow_mut().push(format!("pre_reader:{v}"));
    });

    let o = order.clone();
    let b4 = b.clone();
    let _render = render_effect(
        move |_| {
            let _ = b4.get();
            o.borrow_mut().push("render".to_string());
        },
        None,
    );

    pop(None);
    flush_now();
    order.borrow_mut().clear();

    a.set(1);
    flush_now();

    let log = order.borrow().clone();
    let render_pos = log.iter().position(|e| e == "render");
    let reader_pos = log.iter().position(|e| e == "pre_reader:10");
    assert!(
        reader_pos.is_some() && render_pos.is_some() && reader_pos < render_pos,
        "pre work settles before render, got {log:?}"
    );
    drop(frame);
}
