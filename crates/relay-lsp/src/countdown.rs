//! Demo countdown commands.
//!
//! Both count from the configured start down to 1 and show one message per
//! step. The blocking variant sleeps on the worker thread and holds the relay
//! for its whole duration; nothing else is processed until it returns. The
//! non-blocking variant runs as its own task and sleeps with the timer, so
//! other events interleave with it.

use tokio::task::JoinHandle;
use tower_lsp::lsp_types::MessageType;

use crate::config::CountdownConfig;
use crate::outbound::Outbox;

pub const COUNT_DOWN_BLOCKING: &str = "countDownBlocking";
pub const COUNT_DOWN_NON_BLOCKING: &str = "countDownNonBlocking";

pub(crate) fn countdown_message(step: u32) -> String {
    format!("Counting down... {step}")
}

/// Shows every step while sleeping on the worker thread.
///
/// On the current-thread runtime the outbox pump cannot run until this
/// returns, so the messages are queued and reach the editor together at the
/// end.
pub(crate) fn count_down_blocking(outbox: &Outbox, config: &CountdownConfig) {
    for step in (1..=config.start).rev() {
        outbox.show_message(MessageType::INFO, countdown_message(step));
        std::thread::sleep(config.step);
    }
}

pub(crate) fn spawn_count_down_non_blocking(
    outbox: Outbox,
    config: CountdownConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for step in (1..=config.start).rev() {
            outbox.show_message(MessageType::INFO, countdown_message(step));
            tokio::time::sleep(config.step).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::Outbound;
    use std::time::{Duration, Instant};

    fn drain_texts(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Outbound::ShowMessage { text, .. } = message {
                texts.push(text);
            }
        }
        texts
    }

    #[test]
    fn blocking_countdown_emits_every_step_before_returning() {
        let (outbox, mut rx) = Outbox::new();
        let config = CountdownConfig {
            start: 10,
            step: Duration::from_millis(5),
        };
        let started = Instant::now();
        count_down_blocking(&outbox, &config);
        assert!(started.elapsed() >= Duration::from_millis(50));

        let expected: Vec<String> = (1..=10).rev().map(countdown_message).collect();
        assert_eq!(drain_texts(&mut rx), expected);
    }

    #[tokio::test]
    async fn non_blocking_countdown_yields_between_steps() {
        let (outbox, mut rx) = Outbox::new();
        let config = CountdownConfig {
            start: 3,
            step: Duration::from_millis(30),
        };
        let task = spawn_count_down_non_blocking(outbox, config);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());
        assert_eq!(drain_texts(&mut rx), vec![countdown_message(3)]);

        task.await.expect("countdown task");
        assert_eq!(
            drain_texts(&mut rx),
            vec![countdown_message(2), countdown_message(1)]
        );
    }
}
