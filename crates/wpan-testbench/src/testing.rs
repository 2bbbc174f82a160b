//! Testing utilities
//!
//! [`ScriptedBackend`] stands in for the host when unit or integration tests
//! exercise interface handles, the allocator, or a whole testbed. It records
//! every invocation and answers from scripted responses keyed by substring.

use crate::exec::{CommandOutput, ExecError, ExecutionBackend, Invocation};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Debug)]
enum Reply {
    Output(CommandOutput),
    SpawnError,
}

#[derive(Debug)]
struct Rule {
    needle: String,
    reply: Reply,
    once: bool,
}

/// Execution backend answering from a script instead of the host.
///
/// Rules are matched against the rendered command line. One-shot rules are
/// consumed first (oldest first), then the most recently added sticky rule
/// containing the needle wins. Unmatched commands succeed silently.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every command containing `needle` with `output`.
    pub fn on(&self, needle: &str, output: CommandOutput) -> &Self {
        self.push(needle, Reply::Output(output), false)
    }

    /// Answer the next command containing `needle` with `output`.
    pub fn once(&self, needle: &str, output: CommandOutput) -> &Self {
        self.push(needle, Reply::Output(output), true)
    }

    /// Make every command containing `needle` fail to spawn.
    pub fn error_on(&self, needle: &str) -> &Self {
        self.push(needle, Reply::SpawnError, false)
    }

    fn push(&self, needle: &str, reply: Reply, once: bool) -> &Self {
        self.rules.lock().push(Rule {
            needle: needle.to_string(),
            reply,
            once,
        });
        self
    }

    /// Every command line run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Command lines containing `needle`, in order
    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.contains(needle))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn reply_for(&self, line: &str) -> Reply {
        let mut rules = self.rules.lock();
        if let Some(pos) = rules
            .iter()
            .position(|r| r.once && line.contains(&r.needle))
        {
            return rules.remove(pos).reply;
        }
        rules
            .iter()
            .rev()
            .find(|r| !r.once && line.contains(&r.needle))
            .map(|r| r.reply.clone())
            .unwrap_or_else(|| Reply::Output(CommandOutput::ok("")))
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        let line = invocation.to_string();
        self.calls.lock().push(line.clone());
        match self.reply_for(&line) {
            Reply::Output(output) => Ok(output),
            Reply::SpawnError => Err(ExecError::Spawn {
                command: line,
                source: std::io::Error::other("scripted spawn failure"),
            }),
        }
    }
}

/// Sample `iwpan dev` listing with `count` fakelb devices.
///
/// Devices are named `wpan0..wpan{count-1}` and sit on `phy0..`.
pub fn iwpan_dev_listing(count: usize) -> String {
    let mut out = String::new();
    for i in 0..count {
        out.push_str(&format!(
            "phy#{i}\n\tInterface wpan{i}\n\t\tifindex {idx}\n\t\twpan_dev 0x{i}\n\t\textended_addr 0xbe1a7f1c0a5e{i:04x}\n\t\tshort_addr 0xffff\n\t\tpan_id 0xffff\n\t\ttype node\n\t\tmax_frame_retries 3\n",
            idx = i + 10
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_backend_rules() {
        let backend = ScriptedBackend::new();
        backend
            .on("ip addr show", CommandOutput::ok("sticky"))
            .once("ip addr show", CommandOutput::ok("first"));

        let inv = Invocation::new("ip").args(["addr", "show", "lo"]);
        assert_eq!(backend.run(&inv).await.unwrap().stdout, "first");
        assert_eq!(backend.run(&inv).await.unwrap().stdout, "sticky");
        assert_eq!(backend.run(&inv).await.unwrap().stdout, "sticky");

        let other = Invocation::new("true");
        assert!(backend.run(&other).await.unwrap().is_quiet());

        backend.error_on("modprobe");
        assert!(backend
            .run(&Invocation::new("modprobe").arg("fakelb"))
            .await
            .is_err());

        assert_eq!(backend.calls().len(), 5);
        assert_eq!(backend.calls_matching("ip addr").len(), 3);
    }

    #[test]
    fn test_iwpan_listing_shape() {
        let listing = iwpan_dev_listing(2);
        assert!(listing.contains("phy#1\n\tInterface wpan1"));
        assert_eq!(listing.matches("Interface").count(), 2);
    }
}
