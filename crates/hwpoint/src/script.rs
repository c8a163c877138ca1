//! Command-line value parsing: addresses, point kinds and simulation steps.

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use hwpoint_core::point::{HardwarePointRequest, PointKind};
use hwpoint_core::types::{Address, ThreadId};

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_u64(s: &str) -> Result<u64, String>
{
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|err| format!("invalid number '{s}': {err}"))
}

/// Point kind as written on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg
{
    /// Hardware breakpoint
    #[value(alias = "break", alias = "exec")]
    Execute,
    /// Read watchpoint
    Read,
    /// Write watchpoint
    Write,
    /// Read or write watchpoint
    #[value(alias = "rw")]
    Access,
}

impl From<KindArg> for PointKind
{
    fn from(kind: KindArg) -> Self
    {
        match kind {
            KindArg::Execute => PointKind::Execute,
            KindArg::Read => PointKind::Read,
            KindArg::Write => PointKind::Write,
            KindArg::Access => PointKind::Access,
        }
    }
}

/// Build the request for `kind` at `address`.
///
/// Breakpoints take `length` as a range length (0 for a plain breakpoint);
/// watchpoints default to one byte.
pub fn request(kind: PointKind, address: u64, length: Option<u64>) -> HardwarePointRequest
{
    let address = Address::new(address);
    match kind {
        PointKind::Execute => match length {
            Some(length) if length > 0 => HardwarePointRequest::ranged_breakpoint(address, length),
            _ => HardwarePointRequest::breakpoint(address),
        },
        _ => HardwarePointRequest::watch(kind, address, length.unwrap_or(1)),
    }
}

/// One step of a simulated session
///
/// Syntax:
///
/// - `insert:<kind>:<addr>[:<len>]`, `remove:<kind>:<addr>[:<len>]`
/// - `thread:<tid>` (new thread), `exit:<tid>`
/// - `resume[:<tid>]` (flush pending register writes, default: all threads)
/// - `reject` (the next register write is rejected)
/// - `vanish:<tid>` (the thread disappears from the kernel)
#[derive(Debug, Clone, PartialEq)]
pub enum Step
{
    /// Insert a point on every thread.
    Insert(HardwarePointRequest),
    /// Remove a point from every thread.
    Remove(HardwarePointRequest),
    /// A new thread appeared.
    Thread(ThreadId),
    /// A thread exited.
    Exit(ThreadId),
    /// Resume one thread or all of them.
    Resume(Option<ThreadId>),
    /// Reject the next register write.
    Reject,
    /// Remove a thread behind the manager's back.
    Vanish(ThreadId),
}

impl FromStr for Step
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        let parts: Vec<&str> = s.split(':').collect();
        let tid = |value: &str| -> Result<ThreadId, String> {
            let raw = parse_u64(value)?;
            i32::try_from(raw)
                .map(ThreadId)
                .map_err(|_| format!("thread id {raw} out of range"))
        };

        match parts.as_slice() {
            [op @ ("insert" | "remove"), kind, address, rest @ ..] if rest.len() <= 1 => {
                let kind = KindArg::from_str(kind, true).map_err(|err| format!("invalid kind '{kind}': {err}"))?;
                let length = rest.first().map(|len| parse_u64(len)).transpose()?;
                let request = request(kind.into(), parse_u64(address)?, length);
                Ok(if *op == "insert" {
                    Step::Insert(request)
                } else {
                    Step::Remove(request)
                })
            }
            ["thread", id] => Ok(Step::Thread(tid(id)?)),
            ["exit", id] => Ok(Step::Exit(tid(id)?)),
            ["vanish", id] => Ok(Step::Vanish(tid(id)?)),
            ["resume"] => Ok(Step::Resume(None)),
            ["resume", id] => Ok(Step::Resume(Some(tid(id)?))),
            ["reject"] => Ok(Step::Reject),
            _ => Err(format!("invalid step '{s}'")),
        }
    }
}

impl fmt::Display for Step
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Step::Insert(request) => write!(f, "insert {} at {} (length {})", request.kind, request.address, request.length),
            Step::Remove(request) => write!(f, "remove {} at {} (length {})", request.kind, request.address, request.length),
            Step::Thread(tid) => write!(f, "new thread {tid}"),
            Step::Exit(tid) => write!(f, "thread {tid} exits"),
            Step::Resume(Some(tid)) => write!(f, "resume thread {tid}"),
            Step::Resume(None) => f.write_str("resume all threads"),
            Step::Reject => f.write_str("reject next register write"),
            Step::Vanish(tid) => write!(f, "thread {tid} vanishes"),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_u64()
    {
        assert_eq!(parse_u64("0x1000"), Ok(0x1000));
        assert_eq!(parse_u64("0xffff_0000"), Ok(0xffff_0000));
        assert_eq!(parse_u64("4096"), Ok(4096));
        assert!(parse_u64("0xzz").is_err());
        assert!(parse_u64("").is_err());
    }

    #[test]
    fn test_parse_insert_step()
    {
        let step: Step = "insert:write:0x1006:4".parse().unwrap();
        assert_eq!(
            step,
            Step::Insert(HardwarePointRequest::watch(PointKind::Write, Address::new(0x1006), 4))
        );

        let step: Step = "remove:exec:0x4000".parse().unwrap();
        assert_eq!(step, Step::Remove(HardwarePointRequest::breakpoint(Address::new(0x4000))));

        let step: Step = "insert:read:0x2000".parse().unwrap();
        assert_eq!(
            step,
            Step::Insert(HardwarePointRequest::watch(PointKind::Read, Address::new(0x2000), 1))
        );
    }

    #[test]
    fn test_parse_thread_steps()
    {
        assert_eq!("thread:101".parse::<Step>(), Ok(Step::Thread(ThreadId(101))));
        assert_eq!("exit:101".parse::<Step>(), Ok(Step::Exit(ThreadId(101))));
        assert_eq!("resume".parse::<Step>(), Ok(Step::Resume(None)));
        assert_eq!("resume:7".parse::<Step>(), Ok(Step::Resume(Some(ThreadId(7)))));
        assert_eq!("reject".parse::<Step>(), Ok(Step::Reject));
        assert_eq!("vanish:3".parse::<Step>(), Ok(Step::Vanish(ThreadId(3))));
    }

    #[test]
    fn test_parse_invalid_steps()
    {
        assert!("insert:write".parse::<Step>().is_err());
        assert!("insert:jump:0x1000".parse::<Step>().is_err());
        assert!("insert:write:0x1000:4:5".parse::<Step>().is_err());
        assert!("thread:99999999999".parse::<Step>().is_err());
        assert!("teleport".parse::<Step>().is_err());
    }
}
