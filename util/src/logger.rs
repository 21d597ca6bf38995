// Copyright 2024 The Courier Developers
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

//! Logging configuration for the courier daemons, built on log4rs with a
//! console appender and an optional size-rotated file appender.

use std::sync::Once;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

static LOGGER_INIT: Once = Once::new();

const LOG_PATTERN: &str = "{d(%Y%m%d %H:%M:%S%.3f)} {h({l})} {M} - {m}{n}";

/// Logging configuration for a daemon process.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
	/// Whether to log to stdout.
	pub log_to_stdout: bool,
	/// Log level for the stdout appender.
	pub stdout_log_level: LevelFilter,
	/// Whether to log to a file.
	pub log_to_file: bool,
	/// Log level for the file appender.
	pub file_log_level: LevelFilter,
	/// Path of the log file.
	pub log_file_path: String,
	/// Size in bytes at which the log file rolls over.
	pub log_max_size: u64,
	/// Number of rotated files to keep.
	pub log_max_files: u32,
}

impl Default for LoggingConfig {
	fn default() -> LoggingConfig {
		LoggingConfig {
			log_to_stdout: true,
			stdout_log_level: LevelFilter::Warn,
			log_to_file: false,
			file_log_level: LevelFilter::Info,
			log_file_path: String::from("courier.log"),
			log_max_size: 16 * 1024 * 1024,
			log_max_files: 8,
		}
	}
}

/// Initialize process-wide logging. Safe to call more than once; only the
/// first call takes effect.
pub fn init_logger(config: &LoggingConfig) {
	let config = config.clone();
	LOGGER_INIT.call_once(move || {
		let mut appenders = vec![];
		let mut appender_names: Vec<&str> = vec![];
		let mut root_level = LevelFilter::Off;

		if config.log_to_stdout {
			let console = ConsoleAppender::builder()
				.encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
				.build();
			appenders.push(
				Appender::builder()
					.filter(Box::new(log4rs::filter::threshold::ThresholdFilter::new(
						config.stdout_log_level,
					)))
					.build("stdout", Box::new(console)),
			);
			appender_names.push("stdout");
			root_level = root_level.max(config.stdout_log_level);
		}

		if config.log_to_file {
			let roller_pattern = format!("{}.{{}}.gz", config.log_file_path);
			let roller = FixedWindowRoller::builder()
				.build(&roller_pattern, config.log_max_files)
				.expect("invalid log roller pattern");
			let policy = CompoundPolicy::new(
				Box::new(SizeTrigger::new(config.log_max_size)),
				Box::new(roller),
			);
			match RollingFileAppender::builder()
				.encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
				.build(&config.log_file_path, Box::new(policy))
			{
				Ok(file) => {
					appenders.push(
						Appender::builder()
							.filter(Box::new(
								log4rs::filter::threshold::ThresholdFilter::new(
									config.file_log_level,
								),
							))
							.build("file", Box::new(file)),
					);
					appender_names.push("file");
					root_level = root_level.max(config.file_log_level);
				}
				Err(e) => eprintln!(
					"unable to open log file {}: {}",
					config.log_file_path, e
				),
			}
		}

		let root = Root::builder()
			.appenders(appender_names)
			.build(root_level);
		let log_config = Config::builder()
			.appenders(appenders)
			.build(root)
			.expect("invalid logging configuration");

		if log4rs::init_config(log_config).is_ok() {
			info!("logging initialized");
		}
	});
}

/// Initialize logging for tests: everything to stdout at debug level.
pub fn init_test_logger() {
	init_logger(&LoggingConfig {
		log_to_stdout: true,
		stdout_log_level: LevelFilter::Debug,
		log_to_file: false,
		..LoggingConfig::default()
	});
}
