//! A [`Runtime`] backed by a `julia` child process.
//!
//! The child runs a small driver that reads one JSON request per line on stdin
//! and answers with one JSON reply per line on stdout. Replies are prefixed
//! with [`REPLY_PREFIX`]; every other stdout line is engine output and gets
//! forwarded to the log.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Arg, BridgeError, BridgeResult, ForeignValue, Runtime};
use crate::config::EngineConfig;

/// Marks protocol replies on the child's stdout.
const REPLY_PREFIX: &str = "\u{1e}IESOPT ";

/// Request loop executed by the child. Values stay in `HANDLES` for the
/// lifetime of the process; only their ids cross the pipe.
const DRIVER: &str = r#"
import JSON
const HANDLES = Dict{Int,Any}()
const NEXT = Ref(0)
const PREFIX = "\x1eIESOPT "

isplain(x) = x isa Union{Bool,Integer,AbstractString} || (x isa Float64 && isfinite(x))

function store!(x)
    NEXT[] += 1
    HANDLES[NEXT[]] = x
    return Dict{String,Any}(
        "ok" => true,
        "handle" => NEXT[],
        "summary" => repr(x),
        "plain" => isplain(x) ? x : nothing,
    )
end

fail(kind, message) = Dict{String,Any}("ok" => false, "kind" => kind, "message" => message)

decode(a) = a["kind"] == "value" ? HANDLES[a["handle"]] : a["data"]

function resolve(path)
    obj = Main
    for part in split(path, '.')
        s = Symbol(part)
        isdefined(obj, s) || return nothing
        obj = getfield(obj, s)
    end
    return obj
end

function dispatch(req)
    op = req["op"]
    if op == "start"
        try
            Core.eval(Main, Meta.parseall("import " * req["module"]))
        catch e
            return fail("startup", sprint(showerror, e))
        end
        return store!(getfield(Main, Symbol(req["module"])))
    elseif op == "resolve"
        obj = resolve(req["path"])
        obj === nothing && return fail("attribute", req["path"])
        return store!(obj)
    elseif op == "eval"
        return store!(Core.eval(Main, Meta.parseall(req["code"])))
    elseif op == "symbol"
        return store!(Symbol(req["text"]))
    elseif op == "call"
        f = HANDLES[req["function"]]
        args = map(decode, req["args"])
        kwargs = [Symbol(k) => decode(v) for (k, v) in req["kwargs"]]
        return store!(f(args...; kwargs...))
    elseif op == "release"
        foreach(h -> delete!(HANDLES, h), req["handles"])
        return Dict{String,Any}("ok" => true)
    end
    return fail("evaluation", "unknown op: " * op)
end

while !eof(stdin)
    line = readline(stdin)
    isempty(line) && continue
    req = JSON.parse(line)
    reply = try
        dispatch(req)
    catch e
        fail("evaluation", sprint(showerror, e))
    end
    reply["id"] = req["id"]
    payload = try
        JSON.json(reply)
    catch e
        err = fail("evaluation", "cannot encode reply: " * sprint(showerror, e))
        err["id"] = req["id"]
        JSON.json(err)
    end
    println(stdout, PREFIX, payload)
    flush(stdout)
end
"#;

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: Request<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Start {
        module: &'a str,
    },
    Resolve {
        path: &'a str,
    },
    Eval {
        code: &'a str,
    },
    Symbol {
        text: &'a str,
    },
    Call {
        function: u64,
        args: Vec<WireArg>,
        kwargs: BTreeMap<String, WireArg>,
    },
    Release {
        handles: &'a [u64],
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireArg {
    Value { handle: u64 },
    Data { data: serde_json::Value },
}

impl From<&Arg> for WireArg {
    fn from(arg: &Arg) -> Self {
        match arg {
            Arg::Value(value) => WireArg::Value {
                handle: value.handle(),
            },
            Arg::Data(data) => WireArg::Data { data: data.clone() },
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    ok: bool,
    handle: Option<u64>,
    summary: Option<String>,
    plain: Option<serde_json::Value>,
    kind: Option<String>,
    message: Option<String>,
}

impl Reply {
    /// Parse a stdout line. Returns `None` for lines that are not replies.
    fn parse(line: &str) -> Option<BridgeResult<Reply>> {
        let payload = line.strip_prefix(REPLY_PREFIX)?;
        Some(serde_json::from_str(payload).map_err(|e| BridgeError::Protocol(e.to_string())))
    }

    fn failure(&mut self) -> Option<BridgeError> {
        if self.ok {
            return None;
        }
        let message = self.message.take().unwrap_or_default();
        Some(match self.kind.as_deref() {
            Some("startup") => BridgeError::Initialization(message),
            Some("attribute") => BridgeError::AttributeResolution(message),
            Some("evaluation") => BridgeError::Evaluation(message),
            other => BridgeError::Protocol(format!("unknown failure kind {other:?}: {message}")),
        })
    }

    /// A successful reply without a value.
    fn into_ack(mut self) -> BridgeResult<()> {
        match self.failure() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn into_result(mut self) -> BridgeResult<ForeignValue> {
        if let Some(e) = self.failure() {
            return Err(e);
        }
        let handle = self
            .handle
            .ok_or_else(|| BridgeError::Protocol("reply without handle".to_string()))?;
        let value = ForeignValue::new(handle, self.summary.unwrap_or_default());
        Ok(match self.plain {
            Some(serde_json::Value::Null) | None => value,
            Some(plain) => value.with_plain(plain),
        })
    }
}

struct Connection {
    // Held so the child is killed when the connection goes away.
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl Connection {
    async fn request(&mut self, request: Request<'_>) -> BridgeResult<Reply> {
        self.next_id += 1;
        let id = self.next_id;
        let mut line = serde_json::to_string(&Envelope { id, request })
            .map_err(|e| BridgeError::Protocol(e.to_string()))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        read_reply(&mut self.stdout, id).await
    }
}

/// Read stdout until the reply to request `id` arrives.
///
/// Replies to earlier requests whose callers went away are skipped.
async fn read_reply<R>(lines: &mut Lines<R>, id: u64) -> BridgeResult<Reply>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let Some(line) = lines.next_line().await? else {
            return Err(BridgeError::Disconnected);
        };
        let Some(reply) = Reply::parse(&line) else {
            info!(target: "iesopt::engine", "{line}");
            continue;
        };
        let reply = reply?;
        if reply.id < id {
            debug!(stale = reply.id, expected = id, "skipping reply to abandoned request");
            continue;
        }
        if reply.id != id {
            return Err(BridgeError::Protocol(format!(
                "reply {} does not match request {id}",
                reply.id
            )));
        }
        return Ok(reply);
    }
}

/// Drives the engine inside a `julia` child process.
pub struct JuliaRuntime {
    config: EngineConfig,
    connection: Mutex<Option<Connection>>,
}

impl JuliaRuntime {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.config.executable);
        command.arg("--startup-file=no");
        if let Some(project) = &self.config.project {
            command.arg(format!("--project={}", project.display()));
        }
        if let Some(threads) = self.config.threads {
            command.arg(format!("--threads={threads}"));
        }
        command
            .arg("-e")
            .arg(DRIVER)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }

    async fn request(&self, request: Request<'_>) -> BridgeResult<Reply> {
        let mut connection = self.connection.lock().await;
        let connection = connection
            .as_mut()
            .ok_or_else(|| BridgeError::Initialization("julia runtime not started".to_string()))?;
        connection.request(request).await
    }
}

#[async_trait]
impl Runtime for JuliaRuntime {
    async fn start(&self, module: &str) -> BridgeResult<ForeignValue> {
        let mut slot = self.connection.lock().await;

        debug!(executable = %self.config.executable.display(), "spawning julia");
        let mut child = self.command().spawn().map_err(|e| {
            BridgeError::Initialization(format!(
                "cannot spawn `{}`: {e}",
                self.config.executable.display()
            ))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(BridgeError::Initialization(
                "julia process has no stdio pipes".to_string(),
            ));
        };

        let mut connection = Connection {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
        };
        let loaded = connection
            .request(Request::Start { module })
            .await
            .and_then(Reply::into_result)
            .map_err(|e| match e {
                BridgeError::Initialization(_) => e,
                other => BridgeError::Initialization(other.to_string()),
            })?;
        *slot = Some(connection);
        Ok(loaded)
    }

    async fn resolve(&self, path: &str) -> BridgeResult<ForeignValue> {
        self.request(Request::Resolve { path }).await?.into_result()
    }

    async fn eval(&self, code: &str) -> BridgeResult<ForeignValue> {
        self.request(Request::Eval { code }).await?.into_result()
    }

    async fn symbol(&self, text: &str) -> BridgeResult<ForeignValue> {
        self.request(Request::Symbol { text }).await?.into_result()
    }

    async fn call(
        &self,
        function: &ForeignValue,
        args: &[Arg],
        kwargs: &[(String, Arg)],
    ) -> BridgeResult<ForeignValue> {
        self.request(Request::Call {
            function: function.handle(),
            args: args.iter().map(WireArg::from).collect(),
            kwargs: kwargs
                .iter()
                .map(|(name, arg)| (name.clone(), WireArg::from(arg)))
                .collect(),
        })
        .await?
        .into_result()
    }

    async fn release(&self, handles: &[u64]) -> BridgeResult<()> {
        self.request(Request::Release { handles }).await?.into_ack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(request: Request<'_>) -> serde_json::Value {
        serde_json::to_value(Envelope { id: 7, request }).unwrap()
    }

    #[test]
    fn eval_request_shape() {
        assert_eq!(
            encode(Request::Eval { code: "1 + 1" }),
            json!({"id": 7, "op": "eval", "code": "1 + 1"})
        );
    }

    #[test]
    fn call_request_encodes_handles_and_data() {
        let function = ForeignValue::new(3, "generate!");
        let model = ForeignValue::new(5, "config");
        let kwargs = [("verbosity".to_string(), Arg::from("warning"))];
        let request = Request::Call {
            function: function.handle(),
            args: [Arg::from(&model), Arg::from(true)]
                .iter()
                .map(WireArg::from)
                .collect(),
            kwargs: kwargs
                .iter()
                .map(|(k, v)| (k.clone(), WireArg::from(v)))
                .collect(),
        };

        assert_eq!(
            encode(request),
            json!({
                "id": 7,
                "op": "call",
                "function": 3,
                "args": [
                    {"kind": "value", "handle": 5},
                    {"kind": "data", "data": true}
                ],
                "kwargs": {"verbosity": {"kind": "data", "data": "warning"}}
            })
        );
    }

    #[test]
    fn multi_statement_code_is_sent_unchanged() {
        let code = "x = 1\ny = 2\nx + y";
        let encoded = encode(Request::Eval { code });
        assert_eq!(encoded["code"], json!(code));

        let line = serde_json::to_string(&Envelope {
            id: 1,
            request: Request::Eval { code },
        })
        .unwrap();
        assert!(!line.contains('\n'));
    }

    #[test]
    fn driver_parses_whole_programs() {
        assert!(DRIVER.contains(r#"Meta.parseall(req["code"])"#));
        assert!(DRIVER.contains(r#"Meta.parseall("import " * req["module"])"#));
        assert!(!DRIVER.contains("Meta.parse("));
    }

    #[test]
    fn driver_only_decodes_json_safe_values() {
        assert!(DRIVER.contains("x isa Float64 && isfinite(x)"));
        assert!(!DRIVER.contains("Real"));
        assert!(DRIVER.contains("cannot encode reply"));
    }

    #[test]
    fn release_request_shape() {
        assert_eq!(
            encode(Request::Release { handles: &[4, 9] }),
            json!({"id": 7, "op": "release", "handles": [4, 9]})
        );
    }

    #[test]
    fn release_ack_has_no_handle() {
        let line = format!(r#"{REPLY_PREFIX}{{"id":3,"ok":true}}"#);
        assert!(Reply::parse(&line).unwrap().unwrap().into_ack().is_ok());
    }

    #[tokio::test]
    async fn replies_to_abandoned_requests_are_skipped() {
        let stream = format!(
            "{REPLY_PREFIX}{{\"id\":2,\"ok\":true,\"handle\":20,\"summary\":\"late\"}}\n\
             [ Info: solving\n\
             {REPLY_PREFIX}{{\"id\":3,\"ok\":true,\"handle\":30,\"summary\":\"3\",\"plain\":3}}\n"
        );
        let mut lines = BufReader::new(stream.as_bytes()).lines();

        let value = read_reply(&mut lines, 3).await.unwrap().into_result().unwrap();

        assert_eq!(value.handle(), 30);
        assert_eq!(value.as_f64(), Some(3.0));
    }

    #[tokio::test]
    async fn reply_from_the_future_is_a_protocol_error() {
        let stream = format!("{REPLY_PREFIX}{{\"id\":5,\"ok\":true,\"handle\":1}}\n");
        let mut lines = BufReader::new(stream.as_bytes()).lines();

        let result = read_reply(&mut lines, 4).await;
        assert!(matches!(result, Err(BridgeError::Protocol(_))));
    }

    #[tokio::test]
    async fn closed_stdout_is_a_disconnect() {
        let mut lines = BufReader::new(&b"[ Info: bye\n"[..]).lines();

        let result = read_reply(&mut lines, 1).await;
        assert!(matches!(result, Err(BridgeError::Disconnected)));
    }

    #[test]
    fn engine_output_is_not_a_reply() {
        assert!(Reply::parse("[ Info: Building model").is_none());
    }

    #[test]
    fn successful_reply_keeps_plain_values() {
        let line = format!(
            r#"{REPLY_PREFIX}{{"id":1,"ok":true,"handle":4,"summary":"true","plain":true}}"#
        );
        let value = Reply::parse(&line).unwrap().unwrap().into_result().unwrap();
        assert_eq!(value.handle(), 4);
        assert_eq!(value.as_bool(), Some(true));
    }

    #[test]
    fn null_plain_is_treated_as_opaque() {
        let line = format!(
            r#"{REPLY_PREFIX}{{"id":1,"ok":true,"handle":2,"summary":"IESopt","plain":null}}"#
        );
        let value = Reply::parse(&line).unwrap().unwrap().into_result().unwrap();
        assert!(value.plain().is_none());
        assert_eq!(value.summary(), "IESopt");
    }

    #[test]
    fn failure_kinds_map_to_bridge_errors() {
        let reply = |kind: &str| Reply {
            id: 1,
            ok: false,
            handle: None,
            summary: None,
            plain: None,
            kind: Some(kind.to_string()),
            message: Some("boom".to_string()),
        };

        assert!(matches!(
            reply("startup").into_result(),
            Err(BridgeError::Initialization(m)) if m == "boom"
        ));
        assert!(matches!(
            reply("attribute").into_result(),
            Err(BridgeError::AttributeResolution(_))
        ));
        assert!(matches!(
            reply("evaluation").into_result(),
            Err(BridgeError::Evaluation(_))
        ));
        assert!(matches!(
            reply("weird").into_result(),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn garbage_after_prefix_is_a_protocol_error() {
        let line = format!("{REPLY_PREFIX}not json");
        assert!(matches!(
            Reply::parse(&line),
            Some(Err(BridgeError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn requests_before_start_fail() {
        let runtime = JuliaRuntime::new(EngineConfig::default());
        let result = runtime.eval("1").await;
        assert!(matches!(result, Err(BridgeError::Initialization(_))));
    }

    #[tokio::test]
    async fn missing_executable_is_an_initialization_error() {
        let runtime = JuliaRuntime::new(EngineConfig {
            executable: "/nonexistent/julia-binary".into(),
            ..EngineConfig::default()
        });
        let result = runtime.start("IESopt").await;
        assert!(matches!(result, Err(BridgeError::Initialization(m)) if m.contains("cannot spawn")));
    }
}
