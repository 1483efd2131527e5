//! Command-line parsing and config merging.

mod clap_parser;

pub use clap_parser::{Cli, parse_cli_to_app_config};
