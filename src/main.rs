pub mod log;

pub mod bytecode;
pub mod classfile;
pub mod config;
pub mod context;
pub mod emitters;
pub mod loader;
pub mod providers;
pub mod remap;
pub mod resolver;
pub mod rewrite;
pub mod rules;
pub mod source;
pub mod validate;
pub mod visit;
pub mod writer;

#[cfg(test)]
mod test_util;

use std::sync::Arc;

use clap::{App, Arg, ArgMatches};

use crate::config::SandboxConfiguration;
use crate::context::{Message, Severity};
use crate::loader::{SandboxClassLoader, SandboxError};
use crate::validate::ReferenceValidator;

fn parse_args<'a>() -> ArgMatches<'a> {
    App::new("glassbox")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Deterministic JVM bytecode sandbox")
        .author(env!("CARGO_PKG_AUTHORS"))
        .arg(
            Arg::with_name("classpath")
                .value_name("CLASSPATH")
                .help("Colon-separated classpath of directories and jars to load classes from")
                .index(1)
                .required(true)
        )
        .arg(
            Arg::with_name("class")
                .value_name("CLASS")
                .help("Binary name of the entry class to load into the sandbox")
                .index(2)
                .required(true)
        )
        .arg(
            Arg::with_name("whitelist")
                .long("whitelist")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Additional whitelist entries (exact names, or prefixes ending in /)")
        )
        .arg(
            Arg::with_name("pin")
                .long("pin")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Classes to pin through the host loader instead of rewriting")
        )
        .arg(
            Arg::with_name("skip-validation")
                .long("skip-validation")
                .help("Do not run the transitive reference validator")
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .takes_value(true)
                .possible_values(&["load", "validate"])
                .use_delimiter(true)
                .help("Enables verbose logging for the provided phases")
        )
        .get_matches()
}

fn print_report(messages: &[Message]) {
    for message in messages.iter() {
        match message.location {
            Some(ref location) => eprintln!("[{}] {}: {}", message.severity, location, message.text),
            None => eprintln!("[{}] {}", message.severity, message.text)
        };
    };
}

fn main() {
    let args = parse_args();

    let mut traced_phases = vec![];

    if let Some(verbose_options) = args.values_of("verbose") {
        for verbose_option in verbose_options {
            match verbose_option {
                "load" => {
                    traced_phases.push(log::Phase::Load);
                },
                "validate" => {
                    traced_phases.push(log::Phase::Validate);
                },
                _ => unreachable!()
            };
        };
    };

    let classpath = args.value_of("classpath").unwrap()
        .split(':')
        .filter(|p| !p.is_empty())
        .map(std::path::PathBuf::from)
        .collect();

    let mut config = SandboxConfiguration::with_classpath(classpath);

    if let Some(entries) = args.values_of("whitelist") {
        let mut whitelist = (*config.whitelist).clone();
        for entry in entries {
            whitelist.add(&entry.replace('.', "/"));
        };
        config.whitelist = Arc::new(whitelist);
    };

    if let Some(pins) = args.values_of("pin") {
        for pin in pins {
            config.pinned_classes.insert(pin.replace('.', "/"));
        };
    };

    let mut loader = SandboxClassLoader::new(Arc::new(config));
    let mut stderr = std::io::stderr();
    let log = log::Log::for_phases(&traced_phases, &mut stderr);

    let start_load = std::time::Instant::now();
    let loaded = loader.load(args.value_of("class").unwrap(), &log);

    let loaded = match loaded {
        Result::Ok(loaded) => loaded,
        Result::Err(SandboxError::ClassLoading { class_name, messages }) => {
            eprintln!("sandbox rejected {}:", class_name);
            print_report(&messages);
            std::process::exit(1);
        },
        Result::Err(err) => {
            eprintln!("{}", err);
            std::process::exit(2);
        }
    };

    println!(
        "Loaded {} as {} ({} bytes, {}) in {:.3}s",
        args.value_of("class").unwrap(),
        loaded.image.name,
        loaded.bytes.len(),
        if loaded.is_modified { "rewritten" } else { "verbatim" },
        start_load.elapsed().as_secs_f32()
    );

    if !args.is_present("skip-validation") {
        let start_validate = std::time::Instant::now();
        let summary = ReferenceValidator::new(&mut loader).validate();
        let errors = summary.messages.iter().filter(|m| m.severity == Severity::Error).count();

        for class in summary.classes.iter() {
            match summary.class_origins.get(class) {
                Some(origin) => {
                    log_writeln!(log, log::Phase::Validate, "validated {} (pulled in by {})", class, origin);
                },
                None => {
                    log_writeln!(log, log::Phase::Validate, "validated {}", class);
                }
            };
        };

        println!(
            "Validated {} classes ({} errors) in {:.3}s",
            summary.classes.len(),
            errors,
            start_validate.elapsed().as_secs_f32()
        );

        if errors > 0 {
            print_report(&summary.messages);
            std::process::exit(1);
        };
    };

    let report = loader.context().sorted_messages();
    if !report.is_empty() {
        print_report(&report);
    };
}
