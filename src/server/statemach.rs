//! Replicated state machine module implementation.

use std::collections::HashMap;

use crate::utils::ViewstampError;
use crate::server::ReplicaId;

use serde::{Serialize, Deserialize};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Command ID type, the op number of the log entry being executed.
pub type CommandId = u64;

/// Command to the state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Get the value of given key.
    Get { key: String },

    /// Put a new value into key.
    Put { key: String, value: String },
}

/// Command execution result returned by the state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    /// `Some(value)` if key is found in state machine, else `None`.
    Get { value: Option<String> },

    /// `Some(old_value)` if key was in state machine, else `None`.
    Put { old_value: Option<String> },
}

/// State is simply a `HashMap` from `String` key -> `String` value.
type State = HashMap<String, String>;

/// The local volatile state machine, which is simply an in-memory HashMap
/// owned by a dedicated executor task.
pub struct StateMachine {
    /// My replica ID.
    me: ReplicaId,

    /// Sender side of the exec channel.
    tx_exec: mpsc::UnboundedSender<(CommandId, Command)>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<(CommandId, CommandResult)>,

    /// Join handle of the executor task. The state HashMap is owned by this
    /// task.
    _executor_handle: JoinHandle<()>,
}

// StateMachine public API implementation
impl StateMachine {
    /// Creates a new state machine and spawns its executor task. Creates an
    /// exec channel for submitting commands and an ack channel for getting
    /// results.
    pub fn new_and_setup(me: ReplicaId) -> Self {
        let (tx_exec, rx_exec) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();

        let executor_handle =
            tokio::spawn(Self::executor_task(me, rx_exec, tx_ack));

        StateMachine {
            me,
            tx_exec,
            rx_ack,
            _executor_handle: executor_handle,
        }
    }

    /// Submits a command by sending it to the exec channel.
    pub fn submit_cmd(
        &mut self,
        id: CommandId,
        cmd: Command,
    ) -> Result<(), ViewstampError> {
        self.tx_exec.send((id, cmd))?;
        Ok(())
    }

    /// Waits for the next execution result by receiving from the ack channel.
    pub async fn get_result(
        &mut self,
    ) -> Result<(CommandId, CommandResult), ViewstampError> {
        match self.rx_ack.recv().await {
            Some((id, result)) => Ok((id, result)),
            None => logged_err!(self.me; "ack channel has been closed"),
        }
    }

    /// Submits a command and waits for its result. Commands are executed in
    /// submission order, so the next result must carry the same ID.
    pub async fn do_sync_cmd(
        &mut self,
        id: CommandId,
        cmd: Command,
    ) -> Result<CommandResult, ViewstampError> {
        self.submit_cmd(id, cmd)?;
        let (result_id, result) = self.get_result().await?;
        if result_id != id {
            return logged_err!(
                self.me;
                "executed id mismatch: expected {}, got {}",
                id,
                result_id
            );
        }
        Ok(result)
    }
}

// StateMachine executor task implementation
impl StateMachine {
    /// Executes given command on the state machine state.
    fn execute(state: &mut State, cmd: &Command) -> CommandResult {
        match cmd {
            Command::Get { key } => CommandResult::Get {
                value: state.get(key).cloned(),
            },
            Command::Put { key, value } => CommandResult::Put {
                old_value: state.insert(key.clone(), value.clone()),
            },
        }
    }

    /// Executor task function.
    async fn executor_task(
        me: ReplicaId,
        mut rx_exec: mpsc::UnboundedReceiver<(CommandId, Command)>,
        tx_ack: mpsc::UnboundedSender<(CommandId, CommandResult)>,
    ) {
        pf_debug!(me; "executor task spawned");

        // create the state HashMap
        let mut state = State::new();

        while let Some((id, cmd)) = rx_exec.recv().await {
            let res = Self::execute(&mut state, &cmd);
            pf_trace!(me; "executed {} {:?}", id, cmd);

            if let Err(e) = tx_ack.send((id, res)) {
                pf_error!(me; "error sending to tx_ack: {}", e);
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "executor task exitted");
    }
}
