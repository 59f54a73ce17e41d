// Copyright (C) 2026-present The rcaflow Authors.
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

use rcaflow_agent::{config::AgentConfig, init_tracing, run};
use std::{env, path::PathBuf};
use tracing::info;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        anyhow::bail!("Usage: {} <config-file>", args[0]);
    }
    let config_file = PathBuf::from(&args[1]);
    let config = match AgentConfig::load(&config_file) {
        Ok(config) => config,
        Err(err) => anyhow::bail!("Parsing config file failed: {err}"),
    };
    init_tracing(&config.logging.level)?;

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    // If num threads is not configured then the default use all CPU cores is used
    if let Some(num_threads) = config.runtime.threads {
        runtime_builder.worker_threads(num_threads);
    }
    runtime_builder.enable_all();
    let runtime = runtime_builder.build()?;
    runtime.block_on(run(config_file, config))?;
    info!("Agent stopped");
    Ok(())
}
