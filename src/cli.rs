use std::path::PathBuf;

use clap::Parser;

use crate::{
    config::{get_config_dir, get_data_dir},
    ids::UserId,
};

#[derive(Parser, Debug)]
#[command(author, version = version(), about)]
pub struct Cli {
    /// Sign in as this user on start-up; a new user id is made up when omitted
    #[arg(short, long, value_name = "USER_ID")]
    pub user: Option<UserId>,

    /// Memo database to use instead of the one in the data directory
    #[arg(short, long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Do not connect to the realtime channel
    #[arg(long)]
    pub offline: bool,

    /// Editing sessions sharing the database and the realtime hub; `session <n>` picks
    /// the one input goes to
    #[arg(short, long, value_name = "COUNT", default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(1..))]
    pub sessions: u8,
}

const VERSION_MESSAGE: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "-",
    env!("VERGEN_GIT_DESCRIBE"),
    " (",
    env!("VERGEN_BUILD_DATE"),
    ")"
);

pub fn version() -> String {
    let author = clap::crate_authors!();

    let config_dir_path = get_config_dir().display().to_string();
    let data_dir_path = get_data_dir().display().to_string();

    format!(
        "\
{VERSION_MESSAGE}

Authors: {author}

Config directory: {config_dir_path}
Data directory: {data_dir_path}"
    )
}
