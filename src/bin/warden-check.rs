//! Syntax and consistency checker for policy files.
//!
//! Loads a policy the same way the engine does and either reports the load
//! error or prints the normalized form, so operators can validate a policy
//! before deploying it to a live system.

use anyhow::{bail, Error};
use serde::Serialize;

use warden_config::{DumpStyle, SecurityBase};

#[derive(Serialize)]
struct GroupSummary {
    name: String,
    inputs: usize,
    rules: usize,
    ignored_rules: usize,
    members_max_access: String,
}

#[derive(Serialize)]
struct PolicySummary {
    user_groups: usize,
    host_groups: usize,
    authorities: usize,
    groups: Vec<GroupSummary>,
}

struct Options {
    use_client_ip: bool,
    json: bool,
    verbose: bool,
    filename: String,
}

fn parse_args() -> Result<Options, Error> {
    let mut options = Options {
        use_client_ip: false,
        json: false,
        verbose: false,
        filename: String::new(),
    };
    for arg in std::env::args().skip(1) {
        if arg == "--ip" {
            options.use_client_ip = true;
        } else if arg == "--json" {
            options.json = true;
        } else if arg == "--verbose" {
            options.verbose = true;
        } else if arg == "--help" {
            println!("usage: warden-check [--ip] [--json] [--verbose] <policy-file>");
            std::process::exit(0);
        } else if arg.starts_with('-') {
            bail!("unknown option '{}'", arg);
        } else {
            if !options.filename.is_empty() {
                bail!("more than one policy file given");
            }
            options.filename = arg;
        }
    }
    if options.filename.is_empty() {
        bail!("no policy file given (try --help)");
    }
    Ok(options)
}

fn summarize(base: &SecurityBase) -> PolicySummary {
    PolicySummary {
        user_groups: base.uags.len(),
        host_groups: base.hags.len(),
        authorities: base.authorities.len(),
        groups: base
            .asgs
            .iter()
            .map(|asg| GroupSummary {
                name: asg.name.clone(),
                inputs: asg.inputs.len(),
                rules: asg.rules.len(),
                ignored_rules: asg.rules.iter().filter(|rule| rule.ignore).count(),
                members_max_access: asg
                    .rules
                    .iter()
                    .filter(|rule| !rule.ignore)
                    .map(|rule| rule.access)
                    .max()
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect(),
    }
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let options = parse_args()?;

    let text = std::fs::read_to_string(&options.filename)
        .map_err(|err| anyhow::format_err!("unable to read '{}' - {}", options.filename, err))?;

    let base = SecurityBase::from_raw(&text, options.use_client_ip)
        .map_err(|err| anyhow::format_err!("{} (status {})", err, err.code()))?;

    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    if options.json {
        serde_json::to_writer_pretty(&mut stdout, &summarize(&base))?;
        println!();
    } else {
        let style = if options.verbose {
            DumpStyle::Verbose
        } else {
            DumpStyle::Plain
        };
        base.write_config(&mut stdout, style)?;
    }

    Ok(())
}
