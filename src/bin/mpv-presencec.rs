//! Debug companion for mpv-presenced: one-shot queries and commands against
//! mpv's JSON IPC socket, sharing the daemon's wire conventions (request_id
//! correlation, event-line skipping). Blocking std sockets are enough here.

use std::{
    env,
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    process,
};

use serde_json::{json, Value};

fn usage() {
    eprintln!(
        "{}",
        r#"Usage:
  mpv-presencec <socket> get <property>
  mpv-presencec <socket> get-string <property>
  mpv-presencec <socket> toggle-pause
  mpv-presencec <socket> raw <json-command-array>

Examples:
  mpv-presencec /tmp/mpvsocket get pause
  mpv-presencec /tmp/mpvsocket get-string mpv-version
  mpv-presencec /tmp/mpvsocket raw '["set_property", "volume", 50]'
"#
    );
}

fn request(stream: &mut UnixStream, command: &Value) -> std::io::Result<Value> {
    let msg = json!({ "command": command, "request_id": 1 });
    stream.write_all(msg.to_string().as_bytes())?;
    stream.write_all(b"\n")?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        let Ok(reply) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        // Event lines carry no request_id; skip them.
        if reply.get("request_id").and_then(Value::as_u64) == Some(1) {
            return Ok(reply);
        }
    }
}

fn main() {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 2 {
        usage();
        process::exit(2);
    }
    let socket = args.remove(0);
    let cmd = args.remove(0);

    let command = match (cmd.as_str(), args.as_slice()) {
        ("get", [prop]) => json!(["get_property", prop]),
        ("get-string", [prop]) => json!(["get_property_string", prop]),
        ("toggle-pause", []) => json!(["cycle", "pause"]),
        ("raw", [body]) => match serde_json::from_str(body) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("mpv-presencec: bad command json: {e}");
                process::exit(2);
            }
        },
        _ => {
            usage();
            process::exit(2);
        }
    };

    let mut stream = match UnixStream::connect(&socket) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("mpv-presencec: connecting to {socket}: {e}");
            process::exit(1);
        }
    };

    match request(&mut stream, &command) {
        Ok(reply) => {
            let error = reply.get("error").and_then(Value::as_str).unwrap_or("");
            if error != "success" {
                eprintln!("mpv-presencec: mpv answered `{error}`");
                process::exit(1);
            }
            if let Some(data) = reply.get("data") {
                if !data.is_null() {
                    println!("{data}");
                }
            }
        }
        Err(e) => {
            eprintln!("mpv-presencec: {e}");
            process::exit(1);
        }
    }
}
