//! A load generator and correctness validator for a running cluster,
//! grounded directly in `examples/original_source/client.py`'s workload and
//! validation logic: each iteration draws a random key and value, `set`s
//! it, deletes it with 10% probability, then immediately `get`s it back and
//! checks the reply against what should be there — "Non existent key" if
//! deleted, the exact value just set otherwise. A mismatch is a detected
//! bug, counted and logged rather than silently accepted. Reply lines are
//! parsed with [`dkv::protocol::Response::parse`] rather than evaluated as
//! code (§9's re-architecting of the source's `eval`-based client).

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use dkv::protocol::{Command, Response};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dkv-loadgen", version, about = "Drives a random read/write workload against a dkv node")]
struct Args {
    /// Node to send requests to. Any node in the cluster works; requests
    /// for keys it does not own are forwarded transparently.
    target: SocketAddr,

    /// Number of set/maybe-delete/get cycles to run.
    #[arg(long, default_value_t = 1000)]
    requests: u64,

    /// Probability (0.0-1.0) that a given cycle deletes the key before the
    /// final get.
    #[arg(long, default_value_t = 0.1)]
    delete_probability: f64,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as i64
}

/// A random lower-case ASCII key, 1-5 characters (§3's test-load key
/// shape), matching the source's `random.sample(string.ascii_lowercase, ...)`.
fn random_key(rng: &mut impl Rng) -> String {
    let len = rng.gen_range(1..=5);
    (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// One request/reply round trip. `Ok(None)` means the peer closed the
/// connection; `Ok(Some(None))` means it replied with something that does
/// not parse as a [`Response`] at all (the source's bare `except: pass`
/// around its `eval(resp)` — here counted rather than swallowed).
async fn send(
    write_half: &mut (impl tokio::io::AsyncWrite + Unpin),
    reader: &mut (impl tokio::io::AsyncBufRead + Unpin),
    command: &Command,
) -> anyhow::Result<Option<Option<Response>>> {
    write_half.write_all(format!("{command}\n").as_bytes()).await?;
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(Response::parse(&line)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let stream = TcpStream::connect(args.target).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut rng = rand::thread_rng();
    let mut ok = 0u64;
    let mut errors = 0u64;
    let mut unparseable = 0u64;

    for i in 0..args.requests {
        let key = random_key(&mut rng);
        let value = rng.gen_range(1..=100_000u64);

        let set_req_id = now_millis();
        let set_command = Command::Set { key: key.clone(), value: value.to_string(), req_id: set_req_id };
        let Some(set_reply) = send(&mut write_half, &mut reader, &set_command).await? else {
            warn!(request = i, "connection closed early");
            break;
        };
        match set_reply {
            Some(Response::Ok) => {}
            Some(other) => {
                errors += 1;
                warn!(request = i, %key, reply = ?other, "set did not reply OK");
            }
            None => {
                unparseable += 1;
                warn!(request = i, %key, "unparseable reply to set");
            }
        }

        let deleted = rng.gen_bool(args.delete_probability);
        if deleted {
            let del_req_id = now_millis();
            let del_command = Command::Del { key: key.clone(), req_id: del_req_id };
            let Some(del_reply) = send(&mut write_half, &mut reader, &del_command).await? else {
                warn!(request = i, "connection closed early");
                break;
            };
            match del_reply {
                Some(Response::Ok) => {}
                Some(other) => {
                    errors += 1;
                    warn!(request = i, %key, reply = ?other, "del did not reply OK");
                }
                None => {
                    unparseable += 1;
                    warn!(request = i, %key, "unparseable reply to del");
                }
            }
        }

        let get_req_id = now_millis();
        let get_command = Command::Get { key: key.clone(), req_id: get_req_id };
        let Some(get_reply) = send(&mut write_half, &mut reader, &get_command).await? else {
            warn!(request = i, "connection closed early");
            break;
        };

        // Validation logic lifted straight from the original client: after
        // a delete, the key must read back as absent; otherwise it must
        // read back as exactly the value this cycle set, tagged with this
        // cycle's set req_id.
        match get_reply {
            None => {
                unparseable += 1;
                warn!(request = i, %key, "unparseable reply to get");
            }
            Some(Response::NonExistentKey) if deleted => ok += 1,
            Some(Response::Value { value: got_value, req_id: got_req_id })
                if !deleted && got_req_id == set_req_id && got_value.parse::<u64>() == Ok(value) =>
            {
                ok += 1;
            }
            Some(other) if deleted => {
                errors += 1;
                warn!(request = i, %key, reply = ?other, "bug detected: deleted key still readable");
            }
            Some(other) => {
                errors += 1;
                warn!(request = i, %key, expected = value, reply = ?other, "bug detected: get did not return the value just set");
            }
        }

        if i % 100 == 0 {
            info!(request = i, ok, errors, unparseable, "progress");
        }
    }

    info!(ok, errors, unparseable, total = args.requests, "workload complete");
    Ok(())
}
