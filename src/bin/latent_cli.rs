//! CLI client for the `latentd` daemon.
//!
//! Examples:
//!   latent-cli status
//!   latent-cli live
//!   latent-cli feed 5f1c project_42
//!   latent-cli params tree.json --log --percentiles 1,99
//!   latent-cli job tree.json project_42 conda --env umap --file run.py
//!   latent-cli --session beamline save
//!
//! By default it talks to 127.0.0.1:8071 (or `LATENTD_ADDR`); override with
//! `--addr host:port`.

use latent_live::job::{FlowSpec, FlowType};
use latent_live::live::{encode_envelope, LiveEvent};
use latent_live::SessionView;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::process;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetState,
    ToggleLive,
    LiveMessage {
        message: Value,
    },
    ExtractParameters {
        tree: Value,
        log: bool,
        percentiles: Option<Vec<f64>>,
        mask: Option<String>,
    },
    BuildJob {
        tree: Value,
        log: bool,
        percentiles: Option<Vec<f64>>,
        mask: Option<String>,
        project_name: String,
        flow: FlowSpec,
    },
    SaveSession,
    LoadSession,
    ResetSession,
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
struct ClientRequest {
    session: String,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum Response {
    State(SessionView),
    Parameters { params: Value, errors: bool },
    Job { job: Value },
    Success { message: String },
    Error { message: String },
}

fn usage() -> ! {
    eprintln!("latent-cli (talks to latentd @ 127.0.0.1:8071 by default)");
    eprintln!("Usage: latent-cli [--addr host:port] [--session id] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  status                           Show session state");
    eprintln!("  live                             Toggle live mode");
    eprintln!("  feed <flow_id> <project_name>    Send a live result event");
    eprintln!("  params <tree.json> [transform]   Extract model parameters");
    eprintln!("  job <tree.json> <project> <flow> [transform] [flow options]");
    eprintln!("                                   Assemble a job request (flow: podman|docker|conda|slurm)");
    eprintln!("  save | load | reset              Session persistence controls");
    eprintln!("  shutdown                         Save all sessions and exit daemon");
    eprintln!();
    eprintln!("Transform options: --log  --mask M  --percentiles LO,HI");
    eprintln!("Flow options:      --image NAME[:TAG]  --file PY  --env CONDA_ENV");
    process::exit(1);
}

fn fail(msg: &str) -> ! {
    eprintln!("{}", msg);
    process::exit(1);
}

struct Options {
    addr: String,
    session: String,
    args: Vec<String>,
}

fn parse_args() -> Options {
    let mut addr = std::env::var("LATENTD_ADDR").unwrap_or_else(|_| "127.0.0.1:8071".to_string());
    let mut session = "default".to_string();
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    while args.len() >= 2 && (args[0] == "--addr" || args[0] == "--session") {
        let value = args[1].clone();
        if args[0] == "--addr" {
            addr = value;
        } else {
            session = value;
        }
        args.drain(0..2);
    }

    if args.is_empty() {
        usage();
    }

    Options {
        addr,
        session,
        args,
    }
}

/// Pull `--flag value` out of `args`.
fn take_value(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    if pos + 1 >= args.len() {
        fail(&format!("{flag} needs a value"));
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Some(value)
}

fn take_switch(args: &mut Vec<String>, flag: &str) -> bool {
    match args.iter().position(|a| a == flag) {
        Some(pos) => {
            args.remove(pos);
            true
        }
        None => false,
    }
}

struct Transform {
    log: bool,
    percentiles: Option<Vec<f64>>,
    mask: Option<String>,
}

fn take_transform(args: &mut Vec<String>) -> Transform {
    let log = take_switch(args, "--log");
    let mask = take_value(args, "--mask");
    let percentiles = take_value(args, "--percentiles").map(|raw| {
        let parsed: Result<Vec<f64>, _> = raw.split(',').map(|p| p.trim().parse::<f64>()).collect();
        match parsed {
            Ok(v) if v.len() == 2 => v,
            _ => fail("--percentiles must be LO,HI"),
        }
    });
    Transform {
        log,
        percentiles,
        mask,
    }
}

fn read_tree(path: &str) -> Value {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|e| fail(&format!("read {path}: {e}")));
    serde_json::from_str(&raw).unwrap_or_else(|e| fail(&format!("parse {path}: {e}")))
}

fn send_request(addr: &str, req: &ClientRequest) -> Result<Response, String> {
    let mut stream = TcpStream::connect(addr).map_err(|e| format!("connect: {e}"))?;
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .map_err(|e| format!("set_read_timeout: {e}"))?;
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| format!("clone: {e}"))?);

    let line = serde_json::to_string(req).map_err(|e| format!("serialize: {e}"))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|e| format!("send: {e}"))?;

    let mut resp_line = String::new();
    reader
        .read_line(&mut resp_line)
        .map_err(|e| format!("recv: {e}"))?;
    serde_json::from_str(&resp_line).map_err(|e| format!("parse response: {e}"))
}

fn print_state(s: SessionView) {
    println!(
        "mode={:<6} activations={} points={} accepted={} ignored={} dropped={}",
        s.mode.as_str(),
        s.activations,
        s.point_count,
        s.counters.accepted,
        s.counters.ignored,
        s.counters.dropped,
    );
    println!(
        "project: root_uri={:?} data_type={} datasets={}",
        s.project.root_uri,
        s.project.data_type.as_str(),
        s.project.datasets.len(),
    );
    for d in &s.project.datasets {
        println!("  #{:<4} {}", d.cumulative_data_count, d.uri);
    }
}

fn main() {
    let Options {
        addr,
        session,
        mut args,
    } = parse_args();
    let cmd = args.remove(0);

    let request = match cmd.as_str() {
        "status" => Request::GetState,
        "live" => Request::ToggleLive,
        "feed" => {
            if args.len() < 2 {
                usage();
            }
            Request::LiveMessage {
                message: encode_envelope(&LiveEvent {
                    flow_id: args[0].clone(),
                    project_name: args[1].clone(),
                }),
            }
        }
        "params" => {
            let t = take_transform(&mut args);
            if args.is_empty() {
                usage();
            }
            Request::ExtractParameters {
                tree: read_tree(&args[0]),
                log: t.log,
                percentiles: t.percentiles,
                mask: t.mask,
            }
        }
        "job" => {
            let t = take_transform(&mut args);
            let image = take_value(&mut args, "--image");
            let python_file_name = take_value(&mut args, "--file");
            let conda_env = take_value(&mut args, "--env");
            if args.len() < 3 {
                usage();
            }
            let flow_type = FlowType::parse(&args[2])
                .unwrap_or_else(|| fail("flow must be podman|docker|conda|slurm"));
            let (image_name, image_tag) = match image {
                Some(img) => match img.split_once(':') {
                    Some((name, tag)) => (Some(name.to_string()), Some(tag.to_string())),
                    None => (Some(img), None),
                },
                None => (None, None),
            };
            Request::BuildJob {
                tree: read_tree(&args[0]),
                log: t.log,
                percentiles: t.percentiles,
                mask: t.mask,
                project_name: args[1].clone(),
                flow: FlowSpec {
                    flow_type,
                    image_name,
                    image_tag,
                    python_file_name,
                    conda_env,
                },
            }
        }
        "save" => Request::SaveSession,
        "load" => Request::LoadSession,
        "reset" => Request::ResetSession,
        "shutdown" => Request::Shutdown,
        _ => usage(),
    };

    let req = ClientRequest { session, request };
    match send_request(&addr, &req) {
        Ok(Response::State(s)) => print_state(s),
        Ok(Response::Parameters { params, errors }) => {
            if errors {
                eprintln!("warning: parameter panel reports input errors");
            }
            match serde_json::to_string_pretty(&params) {
                Ok(s) => println!("{s}"),
                Err(e) => fail(&format!("format: {e}")),
            }
        }
        Ok(Response::Job { job }) => match serde_json::to_string_pretty(&job) {
            Ok(s) => println!("{s}"),
            Err(e) => fail(&format!("format: {e}")),
        },
        Ok(Response::Success { message }) => println!("{message}"),
        Ok(Response::Error { message }) => {
            eprintln!("Error: {message}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed: {e}");
            process::exit(1);
        }
    }
}
