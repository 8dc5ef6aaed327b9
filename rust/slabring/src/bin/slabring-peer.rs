//! Peer process for cross-process tests.
//!
//! Attaches to a named queue or arena created by another process and does
//! one job:
//!
//! - `--role=produce`: push `--base`..`--base + --count` into an MPSC queue of `u64`
//! - `--role=consume`: pop `--count` values from an MPSC queue and print their sum
//! - `--role=alloc`: allocate `--count` chunks of `--size` bytes from an arena
//!   with `--chunk-sizes` and keep them
//!
//! Exit codes: 0 success, 2 bad arguments, 3 invalid parameters on attach,
//! 1 any other error.

use std::process::ExitCode;

use slabring::{Arena, ErrorKind, Mpsc, Queue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Produce,
    Consume,
    Alloc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PeerArgs {
    role: Role,
    name: String,
    capacity: usize,
    count: u64,
    base: u64,
    size: usize,
    chunk_sizes: Vec<usize>,
}

impl PeerArgs {
    /// Parse `--key=value` arguments. Unknown arguments are ignored.
    fn from_args<I, S>(args: I) -> Result<Self, PeerArgsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut role = None;
        let mut name = None;
        let mut capacity = 64;
        let mut count = 0;
        let mut base = 0;
        let mut size = 0;
        let mut chunk_sizes = Vec::new();

        for arg in args {
            let arg = arg.as_ref();
            if let Some(value) = arg.strip_prefix("--role=") {
                role = Some(match value {
                    "produce" => Role::Produce,
                    "consume" => Role::Consume,
                    "alloc" => Role::Alloc,
                    _ => return Err(PeerArgsError::InvalidRole),
                });
            } else if let Some(value) = arg.strip_prefix("--name=") {
                name = Some(value.to_owned());
            } else if let Some(value) = arg.strip_prefix("--capacity=") {
                capacity = value.parse().map_err(|_| PeerArgsError::InvalidNumber("capacity"))?;
            } else if let Some(value) = arg.strip_prefix("--count=") {
                count = value.parse().map_err(|_| PeerArgsError::InvalidNumber("count"))?;
            } else if let Some(value) = arg.strip_prefix("--base=") {
                base = value.parse().map_err(|_| PeerArgsError::InvalidNumber("base"))?;
            } else if let Some(value) = arg.strip_prefix("--size=") {
                size = value.parse().map_err(|_| PeerArgsError::InvalidNumber("size"))?;
            } else if let Some(value) = arg.strip_prefix("--chunk-sizes=") {
                chunk_sizes = value
                    .split(',')
                    .map(str::parse)
                    .collect::<Result<_, _>>()
                    .map_err(|_| PeerArgsError::InvalidNumber("chunk-sizes"))?;
            }
        }

        Ok(Self {
            role: role.ok_or(PeerArgsError::MissingRole)?,
            name: name.ok_or(PeerArgsError::MissingName)?,
            capacity,
            count,
            base,
            size,
            chunk_sizes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerArgsError {
    MissingRole,
    MissingName,
    InvalidRole,
    InvalidNumber(&'static str),
}

impl std::fmt::Display for PeerArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerArgsError::MissingRole => write!(f, "missing --role argument"),
            PeerArgsError::MissingName => write!(f, "missing --name argument"),
            PeerArgsError::InvalidRole => write!(f, "--role must be produce, consume or alloc"),
            PeerArgsError::InvalidNumber(key) => write!(f, "invalid number for --{key}"),
        }
    }
}

impl std::error::Error for PeerArgsError {}

fn run(args: &PeerArgs) -> slabring::Result<()> {
    match args.role {
        Role::Produce => {
            let queue: Queue<u64, Mpsc> = Queue::named(&args.name, args.capacity)?;
            for value in args.base..args.base + args.count {
                queue.push(value);
            }
        }
        Role::Consume => {
            let queue: Queue<u64, Mpsc> = Queue::named(&args.name, args.capacity)?;
            let mut consumer = queue.consumer()?;
            let sum: u64 = (0..args.count).map(|_| consumer.pop()).sum();
            println!("{sum}");
        }
        Role::Alloc => {
            let arena = Arena::named(&args.name, &args.chunk_sizes, args.capacity)?;
            for _ in 0..args.count {
                let Some(chunk) = arena.allocate(args.size) else {
                    return Err(slabring::Error::Temporary);
                };
                unsafe { chunk.as_ptr().write_bytes(0xa5, args.size) };
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = match PeerArgs::from_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("slabring-peer: {err}");
            return ExitCode::from(2);
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("slabring-peer: {err}");
            match err.kind() {
                ErrorKind::InvalidParameter => ExitCode::from(3),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
