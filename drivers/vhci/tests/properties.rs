//! Property tests over random submit, pull, respond and cancel sequences.

mod common;

use proptest::prelude::*;

use common::{Event, Fixture};
use vhci_broker::{OpId, OpStatus, Pulled};

#[derive(Debug, Clone)]
enum Action {
    Submit,
    Pull,
    Respond(u8),
    Cancel(u8),
    CancelConsumer,
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => Just(Action::Submit),
        2 => Just(Action::Pull),
        2 => any::<u8>().prop_map(Action::Respond),
        1 => any::<u8>().prop_map(Action::Cancel),
        1 => Just(Action::CancelConsumer),
    ]
}

/// Apply `actions`, returning the number of callers and consumers created
fn run(fx: &Fixture, actions: &[Action]) -> Result<(u64, u32), TestCaseError> {
    let mut callers = 0u64;
    let mut consumers = 0u32;

    for act in actions {
        match act {
            Action::Submit => {
                callers += 1;
                fx.submit(callers);
            },
            Action::Pull => {
                let _ = fx.broker.pull(fx.consumer(consumers));
                consumers += 1;
            },
            Action::Respond(k) => {
                let last = fx.broker.last_seq_num();
                if last > 0 {
                    let seq_num = 1 + u64::from(*k) % last;
                    if let Some(request) = fx.broker.match_response(seq_num) {
                        fx.broker.complete_request(request, OpStatus::Success);
                    }
                }
            },
            Action::Cancel(k) => {
                if callers > 0 {
                    let id = OpId(1 + u64::from(*k) % callers);
                    if fx.broker.cancel(id) {
                        prop_assert!(!fx.broker.cancel(id), "second cancel of {} succeeded", id);
                        prop_assert!(!fx.broker.is_tracked(id));
                    }
                }
            },
            Action::CancelConsumer => {
                fx.broker.cancel_consumer();
            },
        }
    }
    Ok((callers, consumers))
}

fn drain(fx: &Fixture, callers: u64) {
    fx.broker.cancel_consumer();
    for id in 1..=callers {
        fx.broker.cancel(OpId(id));
    }
    while let Some(request) = fx.broker.fetch_next_pending() {
        if let Some(request) = fx.broker.abandon_delivery(request) {
            fx.broker.release_request(request);
        }
    }
    for seq_num in 1..=fx.broker.last_seq_num() {
        if let Some(request) = fx.broker.match_response(seq_num) {
            fx.broker.complete_request(request, OpStatus::Success);
        }
    }
}

proptest! {
    #[test]
    fn queued_requests_are_delivered_in_order(count in 1u64..32) {
        let fx = Fixture::new();
        for id in 1..=count {
            fx.submit(id);
        }
        for consumer in 0..count {
            let pulled = fx.broker.pull(fx.consumer(consumer as u32));
            prop_assert_eq!(pulled, Ok(Pulled::Delivered { seq_num: consumer + 1 }));
        }

        let expected: Vec<_> = (1..=count).map(|id| (id, Some(id), None)).collect();
        prop_assert_eq!(fx.journal.stored(), expected);
    }

    #[test]
    fn every_operation_completes_exactly_once(actions in proptest::collection::vec(action(), 1..48)) {
        let fx = Fixture::new();
        let (callers, consumers) = run(&fx, &actions)?;
        drain(&fx, callers);

        for id in 1..=callers {
            let completions = fx
                .journal
                .count(|e| matches!(e, Event::CallerCompleted(op, _) if *op == id));
            prop_assert_eq!(completions, 1, "op {}", id);
        }
        for consumer in 0..consumers {
            let completions = fx
                .journal
                .count(|e| matches!(e, Event::ConsumerCompleted(c, _) if *c == consumer));
            prop_assert_eq!(completions, 1, "consumer {}", consumer);
        }

        prop_assert!(fx.broker.is_idle());
        prop_assert_eq!(fx.pool.free_count(), fx.pool.capacity());
    }

    #[test]
    fn sequence_numbers_strictly_increase(actions in proptest::collection::vec(action(), 1..48)) {
        let fx = Fixture::new();
        run(&fx, &actions)?;

        let stored = fx.journal.stored();
        for pair in stored.windows(2) {
            prop_assert!(pair[0].0 < pair[1].0, "{:?} then {:?}", pair[0], pair[1]);
        }
        if let Some(last) = stored.last() {
            prop_assert!(last.0 <= fx.broker.last_seq_num());
        }
    }
}
