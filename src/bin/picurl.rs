use std::io::{self, BufRead};

use anyhow::{Context, Result};
use clap::Parser;

use picproxy::config::DEFAULT_URL_ALPHABET;
use picproxy::constants;
use picproxy::locator::Codec;

/// Prints proxy links for origin URLs given as arguments or on stdin.
#[derive(Parser, Debug)]
#[command(name = "picurl", version)]
struct Cli {
    /// Proxy base address
    #[arg(short = 'b', long = "base", default_value = "http://127.0.0.1:2537")]
    base: String,

    /// Locator alphabet; empty for plain URLs
    #[arg(short = 'a', long = "alphabet", default_value = DEFAULT_URL_ALPHABET)]
    alphabet: String,

    /// Session token appended as `sid`
    #[arg(short = 's', long = "sid")]
    sid: Option<String>,

    urls: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let alphabet = (!cli.alphabet.is_empty()).then_some(cli.alphabet.as_str());
    let codec = Codec::new(alphabet).context("alphabet")?;

    let mut urls = cli.urls.clone();
    if urls.is_empty() {
        for line in io::stdin().lock().lines() {
            let line = line.context("read stdin")?;
            let line = line.trim();
            if !line.is_empty() {
                urls.push(line.to_string());
            }
        }
    }

    let base = cli.base.trim_end_matches('/');
    for url in urls {
        let encoded: String =
            url::form_urlencoded::byte_serialize(codec.encode(&url).as_bytes()).collect();
        let mut link = format!("{base}{}?{}={encoded}", constants::PIC_PATH, constants::PARAM_URL);
        if let Some(sid) = &cli.sid {
            let sid: String = url::form_urlencoded::byte_serialize(sid.as_bytes()).collect();
            link.push_str(&format!("&{}={sid}", constants::PARAM_SESSION));
        }
        println!("{link}");
    }
    Ok(())
}
