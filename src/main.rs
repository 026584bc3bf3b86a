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

//! `server [<port> [<origins>]]`: the relay binary. Port defaults to
//! 8080; origins is a comma-separated allow-list, empty allows any.

use std::env;
use std::process;
use std::sync::Arc;

use log::info;

use chambercast::ChamberDirectory;
use chambercast::Handler;
use chambercast::Listener;
use chambercast::RelayLimits;

#[tokio::main]
async fn main() -> std::io::Result<()> {
  env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or("info"),
  )
  .init();

  let mut args = env::args().skip(1);
  let port: u16 = match args.next() {
    None => 8080,
    Some(arg) => arg.parse().unwrap_or_else(|_| {
      eprintln!("usage: server [<port> [<origins>]]");
      process::exit(2);
    }),
  };
  let origins: Vec<String> = args
    .next()
    .map(|list| {
      list
        .split(',')
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
    })
    .unwrap_or_default();

  // First match wins: the two-peer family sits in front of the default
  // family.
  let handlers: Vec<Arc<dyn Handler>> = vec![
    ChamberDirectory::new("/pair/", origins.clone(), RelayLimits::paired()),
    ChamberDirectory::new("/", origins, RelayLimits::open()),
  ];

  let listener = Listener::bind(("0.0.0.0", port), handlers).await?;
  info!("listening on {}", listener.local_addr()?);
  listener
    .run(async {
      let _ = tokio::signal::ctrl_c().await;
      info!("interrupt received");
    })
    .await
}
