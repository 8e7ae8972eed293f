use comms::msg::{Command, Message, Query, Reply};
use log::{info, warn};

use crate::{DirectoryConfig, MachineRegistry, RelayPool};

/// Everything the request handlers share, guarded by one mutex per
/// directory instance.
pub struct DirectoryState {
    cfg: DirectoryConfig,
    registry: MachineRegistry,
    relays: RelayPool,
}

impl DirectoryState {
    pub fn new(cfg: DirectoryConfig) -> Self {
        Self {
            registry: MachineRegistry::new(),
            relays: RelayPool::new(cfg.relay_ttl),
            cfg,
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.cfg
    }

    pub fn purge_expired_relays(&mut self) -> usize {
        self.relays.purge_expired()
    }

    /// Dispatches one request and produces exactly one reply.
    pub fn handle_request(&mut self, msg: Message<'_>) -> Message<'static> {
        match msg {
            Message::Command(Command::ServerAvailable {
                address,
                description,
                num_slots,
            }) => {
                self.registry.register(address, description, num_slots);
                Message::Ack
            }
            Message::Command(Command::ServerClosing { address }) => {
                match self.registry.deregister(&address) {
                    Some(base_id) => {
                        info!("machine {address} closing");
                        self.relays.drop_base(&base_id);
                        Message::Ack
                    }
                    None => Message::not_ack(format!("unknown server {address}")),
                }
            }
            Message::Command(Command::ReleaseRelaySlot { full_id }) => {
                if self.relays.release(&full_id) {
                    Message::Ack
                } else {
                    Message::not_ack(format!("unknown relay identity {full_id}"))
                }
            }
            Message::Command(Command::ClientClosing) => Message::Ack,
            Message::Query(Query::ServerMachines {
                count,
                max_benchmark_secs,
            }) => Message::Reply(Reply::ServerMachines {
                machines: self.registry.pick(count, max_benchmark_secs),
            }),
            Message::Query(Query::RelaySlot { base_id, port }) => {
                if !self.registry.has_base(&base_id) {
                    return Message::not_ack(format!("unknown relay base {base_id}"));
                }
                Message::Reply(Reply::RelaySlot {
                    full_id: self.relays.allocate(&base_id, port),
                })
            }
            other => {
                warn!("unhandled message: {}", other.kind());
                Message::not_ack(format!("unhandled message: {}", other.kind()))
            }
        }
    }
}
