// Copyright (C) 2025-present The StreamAvg Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use std::{env, path::PathBuf, str::FromStr};
use streamavg_collector::{config::CollectorConfig, run_collector, telemetry::init_meter};
use tracing::{info, warn, Level};

fn init_tracing(level: &'_ str) {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::from_str(level).expect("invalid logging level"))
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        return Err(format!("Usage: {} <config-file>", args[0]).into());
    }
    let config_file = PathBuf::from(&args[1]);
    let config: CollectorConfig = match Figment::new()
        .merge(Yaml::file(config_file))
        .merge(Env::prefixed("STREAMAVG_").split("__"))
        .extract()
    {
        Ok(config) => config,
        Err(err) => {
            return Err(format!("Parsing config file failed: {err}").into());
        }
    };
    config.validate()?;
    init_tracing(&config.logging.level);

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    // If num threads is not configured then the default use all CPU cores is used
    if let Some(num_threads) = config.runtime.threads {
        runtime_builder.worker_threads(num_threads);
    }
    runtime_builder.enable_all();
    let runtime = runtime_builder.build()?;
    runtime.block_on(async move {
        let (meter, provider) = init_meter(config.telemetry.as_ref())?;
        info!(
            "Aggregating {:?} windows with {:?} allowed lateness from {:?}",
            config.aggregation.window_size, config.aggregation.lateness, config.input.directory
        );
        let ret = run_collector(config, meter).await;
        if let Some(provider) = provider {
            if let Err(err) = provider.shutdown() {
                warn!("Failed to flush metrics on shutdown: {err}");
            }
        }
        ret?;
        Ok::<(), Box<dyn std::error::Error + Send + Sync + 'static>>(())
    })
}
