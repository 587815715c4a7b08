use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use dns_model::name::DomainName;
use dns_model::rr::{Rdata, RecordClass, RecordType, Rrset};
use stub_resolver::resolver::{ResolveOptions, Resolver};

fn rdata_text(rdata: &Rdata) -> String {
    match rdata {
        Rdata::A { address } => address.to_string(),
        Rdata::NS { nsdname } => nsdname.to_string(),
        Rdata::CNAME { cname } => cname.to_string(),
        Rdata::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => format!("{mname} {rname} {serial} {refresh} {retry} {expire} {minimum}"),
        Rdata::PTR { ptrdname } => ptrdname.to_string(),
        Rdata::MX {
            preference,
            exchange,
        } => format!("{preference} {exchange}"),
        Rdata::TXT { octets } => format!("\"{}\"", String::from_utf8_lossy(octets)),
        Rdata::AAAA { address } => address.to_string(),
        Rdata::SRV {
            priority,
            weight,
            port,
            target,
        } => format!("{priority} {weight} {port} {target}"),
        Rdata::Unknown { octets, .. } => format!("\\# {}", octets.len()),
    }
}

fn print_section(heading: &str, rrsets: &[Rrset]) {
    if rrsets.is_empty() {
        return;
    }

    println!("\n;; {heading}");
    for rrset in rrsets {
        for rdata in &rrset.rdatas {
            println!(
                "{}\t{}\t{}\t{}\t{}",
                rrset.name,
                rrset.ttl,
                rrset.rclass,
                rrset.rtype,
                rdata_text(rdata)
            );
        }
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Parser)]
/// DNS stub lookup utility
///
/// Sends queries to the recursive nameservers from the system
/// configuration, or to the ones given on the command line.
struct Args {
    /// Domain name to resolve; a name without a trailing dot goes
    /// through the search list
    domain: String,

    /// Query type to resolve
    #[arg(default_value_t = RecordType::A)]
    qtype: RecordType,

    /// Query class to resolve
    #[arg(default_value_t = RecordClass::IN)]
    qclass: RecordClass,

    /// Nameserver to use instead of the configured ones; an IP
    /// address or an https:// URL, can be given more than once
    #[arg(short, long)]
    nameserver: Vec<String>,

    /// Path to a resolv.conf-format file to configure from
    #[arg(short = 'c', long)]
    resolv_conf: Option<PathBuf>,

    /// Use TCP for the initial attempt
    #[arg(long, action(clap::ArgAction::SetTrue))]
    tcp: bool,

    /// Do not use the search list for unqualified names
    #[arg(long, action(clap::ArgAction::SetTrue))]
    no_search: bool,

    /// Overall budget for the lookup, in seconds
    #[arg(short, long)]
    lifetime: Option<f64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let Some(qname) = DomainName::from_dotted_string(&args.domain) else {
        eprintln!("could not parse domain name");
        process::exit(2);
    };

    let resolver = if args.nameserver.is_empty() {
        let configured = match &args.resolv_conf {
            Some(path) => Resolver::from_resolv_conf(path),
            None => Resolver::from_system(),
        };
        match configured {
            Ok(resolver) => resolver,
            Err(error) => {
                eprintln!("{error}");
                process::exit(2);
            }
        }
    } else {
        let mut resolver = Resolver::new();
        resolver.nameservers = args.nameserver.clone();
        resolver
    };

    let options = ResolveOptions {
        tcp: args.tcp,
        raise_on_no_answer: false,
        lifetime: args.lifetime.map(Duration::from_secs_f64),
        search: Some(!args.no_search),
        ..ResolveOptions::default()
    };

    println!(";; QUESTION");
    println!("{}\t{}\t{}", qname, args.qclass, args.qtype);

    match resolver
        .resolve_with(qname, args.qtype, args.qclass, options)
        .await
    {
        Ok(answer) => {
            if answer.rrset.is_none() {
                println!("\n;; ANSWER");
                println!("; {} exists but has no {} records", answer.canonical_name, args.qtype);
            } else {
                print_section("ANSWER", &answer.response.answers);
            }
            print_section("AUTHORITY", &answer.response.authority);

            if let (Some(nameserver), Some(port)) = (&answer.nameserver, answer.port) {
                println!("\n;; from {nameserver}#{port}");
            }
        }
        Err(error) => {
            println!("\n;; ANSWER");
            println!("; {error}");
            process::exit(1);
        }
    }
}
