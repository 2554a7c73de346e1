// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use clap::Parser;
use wirepool::{setup_tracing, AppResult, Gateway, GatewayConfig};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory of the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("conf.toml"), PathBuf::from);
    let gateway_config = GatewayConfig::set_up_optional_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", gateway_config);
        return Ok(());
    }

    let _log_guard = setup_tracing(&commandline.log_dir, commandline.verbose)?;
    Gateway::new(gateway_config).start()
}
