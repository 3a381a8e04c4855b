//! Command-line surface.
//!
//! Rules can be given as repeated `-t`/`-u` flags or as positional
//! `protocol:localPort:remoteAddress:remotePort` tuples, freely mixed. They
//! are returned in the order they appeared on the command line.

use clap::{ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser};
use portfwd_core::{AddressRule, ForwardResult, Protocol};
use std::ffi::OsString;
use std::net::IpAddr;

/// portfwd: multi-rule TCP/UDP port forwarder
#[derive(Parser, Debug)]
#[command(
    name = "portfwd",
    version,
    about = "Multi-rule TCP/UDP port forwarder",
    after_help = "Multiple options can be chained as desired, e.g.\n  \
                  portfwd -t 8080:10.0.0.5:80 -u 5353:10.0.0.53:53 -l 127.0.0.1"
)]
pub struct Cli {
    /// TCP rule
    #[arg(short = 't', long = "tcp", value_name = "LOCAL_PORT:REMOTE_ADDR:REMOTE_PORT")]
    pub tcp: Vec<String>,

    /// UDP rule
    #[arg(short = 'u', long = "udp", value_name = "LOCAL_PORT:REMOTE_ADDR:REMOTE_PORT")]
    pub udp: Vec<String>,

    /// Rules in protocol:localPort:remoteAddress:remotePort form
    #[arg(value_name = "RULE")]
    pub rules: Vec<String>,

    /// Local address every rule binds to [default: 0.0.0.0]
    #[arg(short = 'l', long = "local", value_name = "ADDR")]
    pub local: Option<IpAddr>,

    /// Delete this executable from disk before forwarding starts (may repeat)
    #[arg(short = 'm', long, action = ArgAction::Count)]
    pub melt: u8,

    /// Config file path
    #[arg(long, default_value = "~/.portfwd/config.toml")]
    pub config: String,

    /// Seconds a UDP session may stay idle before it is closed
    #[arg(long, value_name = "SECS")]
    pub udp_idle_timeout: Option<u64>,

    /// Seconds to wait for sessions to drain on shutdown
    #[arg(long, value_name = "SECS")]
    pub grace_period: Option<u64>,

    /// Seconds allowed for each outbound TCP connect
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// One rule exactly as typed, tagged with the flag it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleArg {
    /// `None` for the positional, protocol-prefixed form.
    pub protocol: Option<Protocol>,
    pub raw: String,
}

impl RuleArg {
    pub fn parse(&self, local_ip: IpAddr) -> ForwardResult<AddressRule> {
        match self.protocol {
            Some(protocol) => AddressRule::parse(&self.raw, protocol, local_ip),
            None => AddressRule::parse_tagged(&self.raw, local_ip),
        }
    }
}

impl Cli {
    /// Parse `args`, also recovering the command-line order of the rules.
    pub fn try_parse_ordered<I, T>(args: I) -> Result<(Self, Vec<RuleArg>), clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command().try_get_matches_from(args)?;
        let cli = Self::from_arg_matches(&matches)?;
        let rule_args = ordered_rule_args(&matches);
        debug_assert_eq!(rule_args.len(), cli.tcp.len() + cli.udp.len() + cli.rules.len());
        Ok((cli, rule_args))
    }
}

fn ordered_rule_args(matches: &ArgMatches) -> Vec<RuleArg> {
    let mut indexed: Vec<(usize, RuleArg)> = Vec::new();

    for (id, protocol) in [
        ("tcp", Some(Protocol::Tcp)),
        ("udp", Some(Protocol::Udp)),
        ("rules", None),
    ] {
        if let (Some(values), Some(indices)) = (matches.get_many::<String>(id), matches.indices_of(id)) {
            indexed.extend(indices.zip(values).map(|(index, raw)| {
                (
                    index,
                    RuleArg {
                        protocol,
                        raw: raw.clone(),
                    },
                )
            }));
        }
    }

    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, arg)| arg).collect()
}

/// Validate every rule; the first failure rejects the whole set.
pub fn build_rules(rule_args: &[RuleArg], local_ip: IpAddr) -> ForwardResult<Vec<AddressRule>> {
    rule_args.iter().map(|arg| arg.parse(local_ip)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use portfwd_core::ForwardError;

    fn parse(args: &[&str]) -> (Cli, Vec<RuleArg>) {
        Cli::try_parse_ordered(std::iter::once("portfwd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_rules_keep_command_line_order() {
        let (_, rules) = parse(&[
            "-t", "80:10.0.0.1:8080",
            "-u", "53:10.0.0.53:53",
            "tcp:22:10.0.0.2:22",
            "-t", "81:10.0.0.1:8081",
        ]);
        let raw: Vec<&str> = rules.iter().map(|r| r.raw.as_str()).collect();
        assert_eq!(
            raw,
            ["80:10.0.0.1:8080", "53:10.0.0.53:53", "tcp:22:10.0.0.2:22", "81:10.0.0.1:8081"]
        );
        assert_eq!(rules[0].protocol, Some(Protocol::Tcp));
        assert_eq!(rules[1].protocol, Some(Protocol::Udp));
        assert_eq!(rules[2].protocol, None);
    }

    #[test]
    fn test_defaults() {
        let (cli, rules) = parse(&[]);
        assert!(rules.is_empty());
        assert!(cli.local.is_none());
        assert_eq!(cli.melt, 0);
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.config, "~/.portfwd/config.toml");
    }

    #[test]
    fn test_flags() {
        let (cli, _) = parse(&["-l", "127.0.0.1", "-m", "--udp-idle-timeout", "45", "--grace-period", "1"]);
        assert_eq!(cli.local, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(cli.melt, 1);
        assert_eq!(cli.udp_idle_timeout, Some(45));
        assert_eq!(cli.grace_period, Some(1));
    }

    #[test]
    fn test_melt_may_repeat() {
        let (cli, rules) = parse(&["-m", "-t", "8080:10.0.0.5:80", "--melt", "-m"]);
        assert_eq!(cli.melt, 3);
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_invalid_local_address_rejected() {
        assert!(Cli::try_parse_ordered(["portfwd", "-l", "not-an-ip"]).is_err());
    }

    #[test]
    fn test_build_rules() {
        let (_, args) = parse(&["-t", "8080:10.0.0.5:80", "udp:5353:10.0.0.53:53"]);
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let rules = build_rules(&args, local).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].protocol(), Protocol::Tcp);
        assert_eq!(rules[0].local(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(rules[1].protocol(), Protocol::Udp);
    }

    #[test]
    fn test_build_rules_all_or_nothing() {
        let (_, args) = parse(&["-t", "8080:10.0.0.5:80", "-u", "53:nowhere:53"]);
        match build_rules(&args, "0.0.0.0".parse().unwrap()) {
            Err(ForwardError::Config { input, .. }) => assert_eq!(input, "53:nowhere:53"),
            other => panic!("expected config error, got {other:?}"),
        }
    }
}
