// Copyright 2023 Divy Srivastava <dj.srivastava23@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The accept loop: one driver task per TCP peer, routed through the
//! registered handlers, with a registry of live connections so shutdown
//! can say goodbye properly.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use log::debug;
use log::info;
use log::warn;
use tokio::net::TcpListener;
use tokio::net::ToSocketAddrs;
use tokio::task::JoinSet;

use crate::close;
use crate::connection::Connection;
use crate::connection::ConnectionDriver;
use crate::connection::Handler;

/// Accepts TCP peers and serves them until shutdown.
pub struct Listener {
  listener: TcpListener,
  handlers: Arc<[Arc<dyn Handler>]>,
}

impl Listener {
  pub async fn bind(
    addr: impl ToSocketAddrs,
    handlers: Vec<Arc<dyn Handler>>,
  ) -> io::Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    Ok(Self {
      listener,
      handlers: handlers.into(),
    })
  }

  /// The bound address, so callers can bind port 0 and discover the
  /// real port.
  pub fn local_addr(&self) -> io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  /// Accepts until `shutdown` resolves, then sends every live
  /// connection `close(1001, "Shutting down")` and waits for the drain.
  pub async fn run(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
    let Listener { listener, handlers } = self;
    let live: Arc<Mutex<HashMap<u64, Connection>>> = Arc::default();
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut next_id = 0u64;
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer_addr)) => {
            let id = next_id;
            next_id += 1;
            debug!("connection {id}: accepted from {peer_addr}");
            if let Err(err) = stream.set_nodelay(true) {
              debug!("connection {id}: set_nodelay failed: {err}");
            }
            let driver = ConnectionDriver::new(stream, id);
            live.lock().unwrap().insert(id, driver.connection());
            let live = live.clone();
            let handlers = handlers.clone();
            tasks.spawn(async move {
              driver.run(&handlers).await;
              live.lock().unwrap().remove(&id);
              debug!("connection {id}: finished");
            });
          }
          Err(err) => warn!("accept failed: {err}"),
        },
        Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
      }
    }

    drop(listener);
    let remaining: Vec<Connection> =
      live.lock().unwrap().values().cloned().collect();
    info!("shutting down, closing {} connections", remaining.len());
    for conn in remaining {
      conn.close(close::SHUTTING_DOWN, "Shutting down");
    }
    while tasks.join_next().await.is_some() {}
    Ok(())
  }
}
