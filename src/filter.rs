//! Manages the stacks of filters that can read and modify stanzas on
//! their way between the remote and the application.
//!
//! Both stacks grow at the application end: the newest filter is the
//! first to see outbound stanzas and the last to see inbound ones.

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::stanza::Stanza;

/// Depth of the stanza queues between pipeline stages. Kept small so a
/// slow consumer throttles the stages feeding it.
pub(crate) const QUEUE_DEPTH: usize = 1;

/// A filter task: reads stanzas from its input queue until it closes
/// and sends its output downstream. Dropping the output sender (or
/// returning) closes the chain below. Filters may drop, transform,
/// reorder or originate stanzas.
pub type Filter = Box<
    dyn FnOnce(mpsc::Receiver<Stanza>, mpsc::Sender<Stanza>) -> BoxFuture<'static, ()> + Send,
>;

/// Receive-side stack. Stanzas enter on `input` (from the stream
/// layer) and leave on `output` (to the application). Each added
/// filter takes over the current application-facing end; owning that
/// receiver is what makes the re-routing atomic.
pub(crate) async fn recv_filter_mgr(
    mut add: mpsc::Receiver<Filter>,
    input: mpsc::Receiver<Stanza>,
    output: mpsc::Sender<Stanza>,
) {
    let mut top = input;
    let mut adds_open = true;
    loop {
        tokio::select! {
            filt = add.recv(), if adds_open => match filt {
                Some(filt) => {
                    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
                    let below = std::mem::replace(&mut top, rx);
                    tokio::spawn(filt(below, tx));
                }
                None => adds_open = false,
            },
            stanza = top.recv() => match stanza {
                Some(stanza) => {
                    if output.send(stanza).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Send-side stack. Stanzas enter on `input` (from the application)
/// and leave on `output` (to the gated stream writer). Here the stack
/// grows on the input side, so the newest filter is the first to see
/// application traffic.
pub(crate) async fn send_filter_mgr(
    mut add: mpsc::Receiver<Filter>,
    mut input: mpsc::Receiver<Stanza>,
    output: mpsc::Sender<Stanza>,
) {
    let mut top = output;
    let mut adds_open = true;
    loop {
        tokio::select! {
            filt = add.recv(), if adds_open => match filt {
                Some(filt) => {
                    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
                    let below = std::mem::replace(&mut top, tx);
                    tokio::spawn(filt(rx, below));
                }
                None => adds_open = false,
            },
            stanza = input.recv() => match stanza {
                Some(stanza) => {
                    if top.send(stanza).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{Message, Presence};

    fn tag_filter(tag: &'static str) -> Filter {
        Box::new(move |mut input, output| {
            Box::pin(async move {
                while let Some(mut st) = input.recv().await {
                    if let Stanza::Message(ref mut msg) = st {
                        let id = msg.header.id.take().unwrap_or_default();
                        msg.header.id = Some(format!("{}{}", id, tag));
                    }
                    if output.send(st).await.is_err() {
                        break;
                    }
                }
            })
        })
    }

    fn tagged_message() -> Stanza {
        let mut msg = Message::default();
        msg.header.id = Some("x".to_owned());
        msg.into()
    }

    #[tokio::test]
    async fn recv_forwards_directly_without_filters() {
        let (_add_tx, add_rx) = mpsc::channel(1);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
        let (out_tx, mut out_rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(recv_filter_mgr(add_rx, in_rx, out_tx));

        in_tx.send(Presence::available().into()).await.unwrap();
        assert!(matches!(out_rx.recv().await, Some(Stanza::Presence(_))));
    }

    #[tokio::test]
    async fn recv_filters_run_oldest_first() {
        let (add_tx, add_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
        let (out_tx, mut out_rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(recv_filter_mgr(add_rx, in_rx, out_tx));

        add_tx.send(tag_filter("-f1")).await.unwrap();
        add_tx.send(tag_filter("-f2")).await.unwrap();
        tokio::task::yield_now().await;

        in_tx.send(tagged_message()).await.unwrap();
        match out_rx.recv().await {
            Some(Stanza::Message(msg)) => {
                assert_eq!(msg.header.id.as_deref(), Some("x-f1-f2"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_filters_run_newest_first() {
        let (add_tx, add_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
        let (out_tx, mut out_rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(send_filter_mgr(add_rx, in_rx, out_tx));

        add_tx.send(tag_filter("-f1")).await.unwrap();
        add_tx.send(tag_filter("-f2")).await.unwrap();
        tokio::task::yield_now().await;

        in_tx.send(tagged_message()).await.unwrap();
        match out_rx.recv().await {
            Some(Stanza::Message(msg)) => {
                // Application traffic passes the newest filter first.
                assert_eq!(msg.header.id.as_deref(), Some("x-f2-f1"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn closing_a_filter_closes_the_chain() {
        let (add_tx, add_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
        let (out_tx, mut out_rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(recv_filter_mgr(add_rx, in_rx, out_tx));

        // A filter that consumes nothing and returns immediately,
        // closing its output.
        add_tx
            .send(Box::new(|_input, _output| Box::pin(async {})))
            .await
            .unwrap();

        assert!(out_rx.recv().await.is_none());
        drop(in_tx);
    }

    #[tokio::test]
    async fn input_close_propagates() {
        let (_add_tx, add_rx) = mpsc::channel(1);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
        let (out_tx, mut out_rx) = mpsc::channel::<Stanza>(QUEUE_DEPTH);
        tokio::spawn(recv_filter_mgr(add_rx, in_rx, out_tx));

        drop(in_tx);
        assert!(out_rx.recv().await.is_none());
    }
}
