use anyhow::{anyhow, Context, Result};
use clap::{App, Arg};

use std::fs;
use std::io::stdout;
use std::process;

mod codec;
mod print;
mod scan;

use codec::TapeConfig;
use print::{JsonCollector, SequenceDump, TextPrinter};
use scan::SeqWindow;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("scan")
                .help("Scan for sequences inside an iBoot image")
                .short("s")
                .long("scan"),
        )
        .arg(
            Arg::with_name("output-format")
                .help("The output format to use")
                .short("F")
                .long("format")
                .takes_value(true)
                .possible_values(&["text", "json"])
                .default_value("text"),
        )
        .arg(
            Arg::with_name("file")
                .help("The input file to decode")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("off")
                .help("Byte offset of the window within the file (default 0)")
                .index(2),
        )
        .arg(
            Arg::with_name("len")
                .help("Length of the window (default: to end of file)")
                .index(3),
        )
}

#[derive(Debug)]
struct Options {
    scan: bool,
    json: bool,
    file: String,
    off: u64,
    len: u64,
}

impl Options {
    fn from_matches(matches: &clap::ArgMatches) -> Result<Self> {
        Ok(Self {
            scan: matches.is_present("scan"),
            json: matches.value_of("output-format").unwrap() == "json",
            file: matches.value_of("file").unwrap().to_string(),
            off: matches
                .value_of("off")
                .map(parse_u64)
                .transpose()
                .context("bad offset")?
                .unwrap_or(0),
            len: matches
                .value_of("len")
                .map(parse_u64)
                .transpose()
                .context("bad length")?
                .unwrap_or(0),
        })
    }
}

/// Parses a decimal or 0x/0o/0b-prefixed number.
fn parse_u64(arg: &str) -> Result<u64> {
    let (digits, radix) =
        if let Some(rest) = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
            (rest, 16)
        } else if let Some(rest) = arg.strip_prefix("0o") {
            (rest, 8)
        } else if let Some(rest) = arg.strip_prefix("0b") {
            (rest, 2)
        } else {
            (arg, 10)
        };
    u64::from_str_radix(digits, radix).with_context(|| format!("bad number: {}", arg))
}

/// Checks and decodes one sequence, returning its JSON record when requested.
fn decode_range(
    window: &[u8],
    seq: SeqWindow,
    file_off: u64,
    json: bool,
) -> Result<Option<SequenceDump>> {
    let bytes = &window[seq.offset..seq.offset + seq.len];
    let config = TapeConfig::extracted();

    if let Err(err) = codec::check(bytes, config) {
        return Err(anyhow!(
            "error at offset {:#x} ({}) in sequence at {:#x}",
            err.offset,
            err.reason,
            file_off + seq.offset as u64,
        ));
    }

    if json {
        let mut collector = JsonCollector::default();
        codec::visit(bytes, config, &mut collector)?;
        Ok(Some(SequenceDump {
            offset: file_off + seq.offset as u64,
            len: seq.len,
            commands: collector.commands,
        }))
    } else {
        codec::visit(bytes, config, &mut TextPrinter::new(stdout()))?;
        Ok(None)
    }
}

fn run() -> Result<()> {
    let matches = app().get_matches();
    let opts = Options::from_matches(&matches)?;

    let image = fs::read(&opts.file).with_context(|| format!("failed to read {}", opts.file))?;
    let size = image.len() as u64;
    if opts.off > size {
        return Err(anyhow!(
            "offset {:#x} past end of file ({:#x} bytes)",
            opts.off,
            size
        ));
    }
    let len = if opts.len == 0 { size - opts.off } else { opts.len };
    if opts.off + len > size {
        return Err(anyhow!(
            "window {:#x}+{:#x} past end of file ({:#x} bytes)",
            opts.off,
            len,
            size
        ));
    }
    let window = &image[opts.off as usize..(opts.off + len) as usize];

    let sequences = if opts.scan {
        scan::find_sequences(window)?
    } else {
        vec![SeqWindow {
            offset: 0,
            len: window.len(),
            addr: 0,
            words: 0,
        }]
    };

    let mut dumps = Vec::new();
    for seq in sequences {
        if opts.scan && !opts.json {
            println!("# {:#x} {:#x}", seq.addr, seq.words);
        }
        if let Some(dump) = decode_range(window, seq, opts.off, opts.json)? {
            dumps.push(dump);
        }
    }

    if opts.json {
        serde_json::to_writer(stdout(), &dumps)?;
    }

    Ok(())
}

fn main() {
    env_logger::init();

    process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("\x1b[1;91m{:#}\x1b[0m", e);
            1
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u64_radixes() {
        assert_eq!(parse_u64("0").unwrap(), 0);
        assert_eq!(parse_u64("1234").unwrap(), 1234);
        assert_eq!(parse_u64("0x320").unwrap(), 0x320);
        assert_eq!(parse_u64("0X320").unwrap(), 0x320);
        assert_eq!(parse_u64("0o17").unwrap(), 0o17);
        assert_eq!(parse_u64("0b101").unwrap(), 5);
        assert!(parse_u64("0xzz").is_err());
        assert!(parse_u64("").is_err());
    }
}
