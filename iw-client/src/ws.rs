use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc::unbounded_channel;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::channel::{ChannelConnector, ChannelError, ChannelSocket};

/// Opens channel sockets as WebSocket connections. Binary and text frames
/// are both handed up as bytes; outgoing data is sent as binary frames
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl ChannelConnector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<ChannelSocket, ChannelError>> {
        let url = url.to_string();
        async move {
            let (ws, _) = connect_async(url.as_str()).await.map_err(|e| {
                log::error!("Unable to open channel socket {url:}: {e:}");
                e
            })?;
            let (mut ws_tx, mut ws_rx) = ws.split();
            let (outgoing, mut outgoing_rx) = unbounded_channel::<Vec<u8>>();
            let (incoming_tx, incoming) = unbounded_channel();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        data = outgoing_rx.recv() => {
                            // all senders dropped: channel closed on our side
                            let Some(data) = data else { break };
                            if let Err(e) = ws_tx.send(Message::Binary(data.into())).await {
                                log::warn!("Channel socket {url:} send failed: {e:}");
                                break;
                            }
                        }
                        msg = ws_rx.next() => {
                            let data = match msg {
                                Some(Ok(Message::Binary(data))) => data.to_vec(),
                                Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => continue,
                                Some(Err(e)) => {
                                    log::warn!("Channel socket {url:} error: {e:}");
                                    break;
                                }
                            };
                            if incoming_tx.send(data).is_err() {
                                break;
                            }
                        }
                    }
                }
                ws_tx.close().await.ok();
            });

            Ok(ChannelSocket { outgoing, incoming })
        }
        .boxed()
    }
}
