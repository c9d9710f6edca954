//! Positional-argument allocator protocol
//!
//! `skein-ipam <command> <args...>` prints the bare result on stdout. On
//! failure it exits non-zero with a diagnostic on stderr; the exit code
//! tells the caller which error class to raise.

use super::{Allocator, PortRange};
use skein_common::{Error, Result};
use std::net::Ipv4Addr;

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INVALID: i32 = 2;
pub const EXIT_EXHAUSTED: i32 = 3;
pub const EXIT_NOT_FOUND: i32 = 4;

pub const USAGE: &str = "usage: skein-ipam <command> [args]

commands:
  create-network <network-id> <cidr>
  destroy-network <network-id>
  allocate-address <network-id> <address-id>
  free-address <network-id> <address-id>
  claim-address <network-id> <address-id> <address>
  list-allocations <network-id>
  create-host <host-id> <start-port> <end-port>
  delete-host <host-id>
  allocate-port <host-id> <port-id>
  free-port <host-id> <port-id>
  claim-port <host-id> <port-id> <port>
  list-ports <host-id>";

/// Exit status for an error
pub fn exit_code(err: &Error) -> i32 {
    match err.root() {
        Error::Exhaustion { .. } => EXIT_EXHAUSTED,
        Error::Validation(_) | Error::Config(_) | Error::AlreadyExists { .. } => EXIT_INVALID,
        Error::NotFound { .. } => EXIT_NOT_FOUND,
        _ => EXIT_FAILURE,
    }
}

fn expect_args<'a>(args: &'a [String], count: usize) -> Result<&'a [String]> {
    let rest = &args[1..];
    if rest.len() != count {
        return Err(Error::Validation(format!(
            "{} takes {} argument(s), got {}\n{}",
            args[0],
            count,
            rest.len(),
            USAGE
        )));
    }
    Ok(rest)
}

fn parse<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Validation(format!("invalid {}: {}", what, value)))
}

/// Run one protocol command against `allocator`, returning its stdout
pub async fn dispatch(allocator: &dyn Allocator, args: &[String]) -> Result<String> {
    let Some(command) = args.first() else {
        return Err(Error::Validation(USAGE.to_string()));
    };

    match command.as_str() {
        "create-network" => {
            let a = expect_args(args, 2)?;
            let range = allocator.create_network(&a[0], &a[1]).await?;
            Ok(range.to_string())
        }
        "destroy-network" => {
            let a = expect_args(args, 1)?;
            allocator.destroy_network(&a[0]).await?;
            Ok(String::new())
        }
        "allocate-address" => {
            let a = expect_args(args, 2)?;
            Ok(allocator.allocate_address(&a[0], &a[1]).await?.to_string())
        }
        "free-address" => {
            let a = expect_args(args, 2)?;
            allocator.free_address(&a[0], &a[1]).await?;
            Ok(String::new())
        }
        "claim-address" => {
            let a = expect_args(args, 3)?;
            let address: Ipv4Addr = parse(&a[2], "address")?;
            allocator.claim_address(&a[0], &a[1], address).await?;
            Ok(String::new())
        }
        "list-allocations" => {
            let a = expect_args(args, 1)?;
            let lines: Vec<String> = allocator
                .list_addresses(&a[0])
                .await?
                .into_iter()
                .map(|(id, address)| format!("{} {}", id, address))
                .collect();
            Ok(lines.join("\n"))
        }
        "create-host" => {
            let a = expect_args(args, 3)?;
            let range = PortRange::new(parse(&a[1], "start port")?, parse(&a[2], "end port")?)?;
            allocator.create_host(&a[0], range).await?;
            Ok(String::new())
        }
        "delete-host" => {
            let a = expect_args(args, 1)?;
            allocator.delete_host(&a[0]).await?;
            Ok(String::new())
        }
        "allocate-port" => {
            let a = expect_args(args, 2)?;
            Ok(allocator.allocate_port(&a[0], &a[1]).await?.to_string())
        }
        "free-port" => {
            let a = expect_args(args, 2)?;
            allocator.free_port(&a[0], &a[1]).await?;
            Ok(String::new())
        }
        "claim-port" => {
            let a = expect_args(args, 3)?;
            let port: u16 = parse(&a[2], "port")?;
            allocator.claim_port(&a[0], &a[1], port).await?;
            Ok(String::new())
        }
        "list-ports" => {
            let a = expect_args(args, 1)?;
            let lines: Vec<String> = allocator
                .list_ports(&a[0])
                .await?
                .into_iter()
                .map(|(id, port)| format!("{} {}", id, port))
                .collect();
            Ok(lines.join("\n"))
        }
        other => Err(Error::Validation(format!("unknown command {}\n{}", other, USAGE))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipam::SqliteAllocator;
    use skein_common::Database;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[tokio::test]
    async fn test_protocol_session() {
        let ipam = SqliteAllocator::new(Database::open_memory().unwrap()).unwrap();

        assert_eq!(
            dispatch(&ipam, &args("create-network n1 10.0.1.0/24")).await.unwrap(),
            "10.0.1.1-10.0.1.254"
        );
        assert_eq!(
            dispatch(&ipam, &args("allocate-address n1 web")).await.unwrap(),
            "10.0.1.1"
        );
        assert_eq!(
            dispatch(&ipam, &args("list-allocations n1")).await.unwrap(),
            "web 10.0.1.1"
        );
        assert_eq!(dispatch(&ipam, &args("free-address n1 web")).await.unwrap(), "");

        dispatch(&ipam, &args("create-host h1 30000 30002")).await.unwrap();
        assert_eq!(dispatch(&ipam, &args("allocate-port h1 a")).await.unwrap(), "30000");
        assert_eq!(dispatch(&ipam, &args("allocate-port h1 b")).await.unwrap(), "30001");

        let err = dispatch(&ipam, &args("allocate-port h1 c")).await.unwrap_err();
        assert_eq!(exit_code(&err), EXIT_EXHAUSTED);
    }

    #[tokio::test]
    async fn test_protocol_rejects_bad_input() {
        let ipam = SqliteAllocator::new(Database::open_memory().unwrap()).unwrap();

        let err = dispatch(&ipam, &args("allocate-address n1")).await.unwrap_err();
        assert_eq!(exit_code(&err), EXIT_INVALID);

        let err = dispatch(&ipam, &args("create-host h1 500 100")).await.unwrap_err();
        assert_eq!(exit_code(&err), EXIT_INVALID);

        let err = dispatch(&ipam, &args("allocate-address nope x")).await.unwrap_err();
        assert_eq!(exit_code(&err), EXIT_NOT_FOUND);

        let err = dispatch(&ipam, &args("frobnicate")).await.unwrap_err();
        assert_eq!(exit_code(&err), EXIT_INVALID);

        let err = dispatch(&ipam, &[]).await.unwrap_err();
        assert_eq!(exit_code(&err), EXIT_INVALID);
    }
}
