/*!
 * # Configuration Module
 *
 * Command line argument parsing and the two JSON policy files (banlist and
 * tokens), per §6. Both files are read once at startup and are treated as
 * absent-is-empty: a missing file is not a configuration error, only a
 * malformed one is.
 */

use std::collections::HashSet;
use std::path::Path;

use clap::Parser;
use serde::Deserialize;

use crate::error::Result;
use crate::policy::Policy;

/// Proxy server configuration, populated from command line arguments.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Host or address to bind the proxy server to.
    #[arg(short = 'H', long, default_value = "localhost")]
    pub host: String,

    /// Port to bind the proxy server to.
    #[arg(short, long, default_value_t = 30303, value_parser = clap::value_parser!(u16).range(1..=65535))]
    pub port: u16,

    /// Require a matching `Proxy-Authorization` token on every request.
    #[arg(short, long, default_value_t = false)]
    pub auth: bool,

    /// Path to the banned-hosts JSON file.
    #[arg(short, long, default_value = "banlist.json")]
    pub banlist: String,

    /// Path to the auth tokens JSON file.
    #[arg(short, long, default_value = "tokens.json")]
    pub tokens: String,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

/// `{"banlist": [<string>, ...]}`
#[derive(Debug, Deserialize, Default)]
struct BanlistFile {
    #[serde(default)]
    banlist: Vec<String>,
}

/// `{"tokens": [<string>, ...]}`
#[derive(Debug, Deserialize, Default)]
struct TokensFile {
    #[serde(default)]
    tokens: Vec<String>,
}

/// Read the banlist and tokens files named by `cli` into a [`Policy`]
/// snapshot. Either file being absent yields an empty set rather than an
/// error; a file that exists but fails to parse is a configuration error.
pub fn load_policy_files(cli: &Cli) -> Result<Policy> {
    let banned_hosts = read_json_list::<BanlistFile, _>(&cli.banlist, |f| f.banlist)?;
    let tokens = read_json_list::<TokensFile, _>(&cli.tokens, |f| f.tokens)?;

    Ok(Policy::new(
        cli.auth,
        tokens.into_iter().collect::<HashSet<_>>(),
        banned_hosts.into_iter().collect::<HashSet<_>>(),
    ))
}

fn read_json_list<F, E>(path: impl AsRef<Path>, extract: E) -> Result<Vec<String>>
where
    F: for<'de> Deserialize<'de> + Default,
    E: FnOnce(F) -> Vec<String>,
{
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let contents = std::fs::read_to_string(path)?;
    let parsed: F = serde_json::from_str(&contents)?;
    Ok(extract(parsed))
}
