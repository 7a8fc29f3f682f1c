use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, info, warn};

use super::{
    parse_event, ExitOutcome, HealResponse, RunnerError, RunnerEventHandler, RunnerInvocation,
    RunnerOutput, TestRunner, MAX_CAPTURED_OUTPUT, MAX_EVENT_LINE,
};

/// Runs the test runner as a child process.
///
/// Stdout is read line by line so events reach the handler while the runner
/// is still going. The child is killed if the future is dropped.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    max_output: usize,
    max_line: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            max_output: MAX_CAPTURED_OUTPUT,
            max_line: MAX_EVENT_LINE,
        }
    }
}

impl ProcessRunner {
    pub fn with_max_output(max_output: usize) -> Self {
        Self {
            max_output,
            ..Self::default()
        }
    }

    /// Longest stdout line kept in memory. The rest of a longer line is discarded.
    pub fn max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }
}

#[async_trait]
impl TestRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &RunnerInvocation,
        events: &mut dyn RunnerEventHandler,
    ) -> Result<RunnerOutput, RunnerError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(&invocation.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.workdir {
            cmd.current_dir(dir);
        }

        info!(program = %invocation.program, args = ?invocation.args, "starting test runner");
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or(RunnerError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(RunnerError::Pipe("stderr"))?;
        let mut stdin = child.stdin.take();

        let max_output = self.max_output;
        let max_line = self.max_line;
        let stderr_task = tokio::spawn(read_bounded(stderr, max_output));

        let mut reader = BufReader::new(stdout);
        let mut captured = String::new();
        let mut truncated = false;
        let mut line = Vec::new();
        loop {
            line.clear();
            let (read, cut) = read_line_bounded(&mut reader, &mut line, max_line).await?;
            if read == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            if cut {
                truncated = true;
                warn!(limit = max_line, bytes = read, "runner stdout line too long, kept its head only");
            }

            if captured.len() + text.len() <= max_output {
                captured.push_str(&text);
            } else if !truncated {
                truncated = true;
                warn!(limit = max_output, "runner stdout exceeded capture limit, dropping the rest");
            }

            if let Some(event) = parse_event(&text).filter(|_| !cut) {
                if let Some(reply) = events.on_event(event).await {
                    reply_to_runner(&mut stdin, &reply).await;
                }
            }
        }

        // Close stdin so a runner waiting on replies can exit.
        drop(stdin);
        let status = child.wait().await?;
        let (stderr, stderr_truncated) = stderr_task
            .await
            .map_err(|e| RunnerError::Io(std::io::Error::other(e)))??;

        let exit = match status.code() {
            Some(0) => ExitOutcome::Success,
            Some(code) => ExitOutcome::Failed(code),
            None => ExitOutcome::Terminated,
        };
        debug!(?exit, stdout_bytes = captured.len(), stderr_bytes = stderr.len(), "test runner exited");

        Ok(RunnerOutput {
            exit,
            stdout: captured,
            stderr,
            truncated: truncated || stderr_truncated,
        })
    }
}

async fn reply_to_runner(stdin: &mut Option<ChildStdin>, reply: &HealResponse) {
    let Some(pipe) = stdin.as_mut() else {
        return;
    };
    let mut payload = match serde_json::to_vec(reply) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to encode heal reply");
            return;
        }
    };
    payload.push(b'\n');
    let written = match pipe.write_all(&payload).await {
        Ok(()) => pipe.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        // The runner closed its stdin. It will not read further replies.
        warn!(error = %e, request_id = %reply.request_id, "failed to deliver heal reply");
        *stdin = None;
    }
}

/// Read one `\n`-terminated line into `buf`, keeping at most `limit` bytes.
///
/// Returns the number of bytes consumed from `reader` and whether the line
/// was cut short. A cut line is still consumed up to its newline.
async fn read_line_bounded<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<(usize, bool)>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    let mut cut = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok((consumed, cut));
        }
        let (len, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        let room = limit.saturating_sub(buf.len());
        if len > room {
            cut = true;
        }
        buf.extend_from_slice(&available[..len.min(room)]);
        reader.consume(len);
        consumed += len;
        if done {
            return Ok((consumed, cut));
        }
    }
}

/// Read a stream to the end, keeping at most `limit` bytes.
async fn read_bounded<R>(mut reader: R, limit: usize) -> Result<(String, bool), RunnerError>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok((String::from_utf8_lossy(&kept).into_owned(), truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::runner::{RunnerEvent, TestStatus};

    #[derive(Default)]
    struct Collect {
        events: Vec<RunnerEvent>,
    }

    #[async_trait]
    impl RunnerEventHandler for Collect {
        async fn on_event(&mut self, event: RunnerEvent) -> Option<HealResponse> {
            let reply = match &event {
                RunnerEvent::Heal(req) => Some(HealResponse {
                    request_id: req.request_id.clone(),
                    selector: Some("#healed".to_string()),
                    strategy: Some("test".to_string()),
                    confidence: Some(0.7),
                }),
                _ => None,
            };
            self.events.push(event);
            reply
        }
    }

    fn sh(script: &str) -> RunnerInvocation {
        RunnerInvocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
            workdir: None,
        }
    }

    #[tokio::test]
    async fn test_streams_events_and_captures_output() {
        let script = r#"
echo "Running 1 test"
echo '{"event":"begin","totalTests":1}'
echo '{"event":"testEnd","testFile":"a.spec.ts","testName":"works","status":"passed","durationMs":5}'
echo "$GREETING" >&2
exit 1
"#;
        let mut handler = Collect::default();
        let output = ProcessRunner::default()
            .run(&sh(script), &mut handler)
            .await
            .unwrap();

        assert_eq!(output.exit, ExitOutcome::Failed(1));
        assert!(output.stdout.starts_with("Running 1 test\n"));
        assert_eq!(output.stderr.trim(), "hi");
        assert!(!output.truncated);
        assert_eq!(handler.events.len(), 2);
        match &handler.events[1] {
            RunnerEvent::TestEnd(outcome) => assert_eq!(outcome.status, TestStatus::Passed),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_heal_reply_is_written_to_stdin() {
        let script = r##"
echo '{"event":"heal","requestId":"r1","testFile":"a","testName":"t","selector":"#x","snapshot":{"elements":[]}}'
read reply
echo "got: $reply"
"##;
        let mut handler = Collect::default();
        let output = ProcessRunner::default()
            .run(&sh(script), &mut handler)
            .await
            .unwrap();

        assert_eq!(output.exit, ExitOutcome::Success);
        let echoed = output
            .stdout
            .lines()
            .find_map(|l| l.strip_prefix("got: "))
            .unwrap();
        let reply: HealResponse = serde_json::from_str(echoed).unwrap();
        assert_eq!(reply.request_id, "r1");
        assert_eq!(reply.selector.as_deref(), Some("#healed"));
    }

    #[tokio::test]
    async fn test_capture_limit_truncates_without_killing() {
        let mut handler = Collect::default();
        let output = ProcessRunner::with_max_output(16)
            .run(&sh("for i in 1 2 3 4 5 6 7 8; do echo line-$i; done"), &mut handler)
            .await
            .unwrap();
        assert_eq!(output.exit, ExitOutcome::Success);
        assert!(output.truncated);
        assert!(output.stdout.len() <= 16);
        assert!(output.stdout.starts_with("line-1\n"));
    }

    #[tokio::test]
    async fn test_overlong_line_is_bounded_and_skipped() {
        let script = r#"
head -c 100000 /dev/zero | tr '\0' x
echo
echo '{"event":"begin","totalTests":1}'
"#;
        let mut handler = Collect::default();
        let output = ProcessRunner::default()
            .max_line(64)
            .run(&sh(script), &mut handler)
            .await
            .unwrap();

        assert_eq!(output.exit, ExitOutcome::Success);
        assert!(output.truncated);
        assert!(output.stdout.len() < 200);
        assert!(output.stdout.starts_with(&"x".repeat(64)));
        assert_eq!(handler.events, vec![RunnerEvent::Begin(crate::runner::RunBegin { total_tests: 1 })]);
    }

    #[tokio::test]
    async fn test_line_reader_keeps_head_and_consumes_rest() {
        let input: &[u8] = b"abcdefghij\nnext\n";
        let mut reader = BufReader::with_capacity(4, input);
        let mut line = Vec::new();

        let (read, cut) = read_line_bounded(&mut reader, &mut line, 3).await.unwrap();
        assert_eq!((read, cut), (11, true));
        assert_eq!(line, b"abc");

        line.clear();
        let (read, cut) = read_line_bounded(&mut reader, &mut line, 3).await.unwrap();
        assert_eq!((read, cut), (5, true));
        assert_eq!(line, b"nex");

        line.clear();
        assert_eq!(read_line_bounded(&mut reader, &mut line, 3).await.unwrap(), (0, false));
    }

    #[tokio::test]
    async fn test_signal_is_terminated() {
        let mut handler = Collect::default();
        let output = ProcessRunner::default()
            .run(&sh("kill -9 $$"), &mut handler)
            .await
            .unwrap();
        assert_eq!(output.exit, ExitOutcome::Terminated);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let inv = RunnerInvocation {
            program: "/nonexistent/shardrunner-test-runner".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            workdir: None,
        };
        let mut handler = Collect::default();
        let err = ProcessRunner::default().run(&inv, &mut handler).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }
}
