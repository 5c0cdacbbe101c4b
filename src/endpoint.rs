//! The cloud connection: multiplexes up to `max_connections` server
//! connections drawn from a registry of known servers, ranked by
//! priority, with quarantine of failing servers and fan-out request
//! policies.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use fnv::FnvHashMap;
use slab::Slab;
use slog::Logger;

use connection::{ServerConnection, ServerEvent, WriteId};
use tasks::TaskQueue;
use transport::{Server, TransportFactory};
use {LinkState, StreamInfo, WriteError, WriteState};

/// Parameters governing a cloud connection.
pub struct CloudConfig {
    /// Upper bound on concurrently used server connections.
    pub max_connections: usize,
    /// How long a failing server is excluded from the candidate set (μs).
    pub quarantine_duration: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            max_connections: 2,
            quarantine_duration: 5 * 1000 * 1000,
        }
    }
}

/// Identifies one server connection within the cloud's registry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ServerHandle(pub usize);

impl fmt::Display for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle to one `CloudConnection::write`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct CloudWriteId(pub u64);

/// Where a request goes within the selected set.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Policy {
    /// Dispatch once, to the best selected server.
    MainServer,
    /// Dispatch once, to the server at the given selection index (clamped
    /// to the selected set).
    Priority(usize),
    /// Dispatch in parallel to the first `n` selected servers; the write
    /// finishes when every replica finishes, with the maximum of the
    /// replica states.
    Replica(usize),
}

/// Events of interest to the cloud's user.
#[derive(Debug)]
pub enum CloudEvent {
    /// The selected set changed.
    ServersUpdate,
    /// Inbound bytes from one selected server.
    Data { server: ServerHandle, data: Bytes },
    /// A write reached a terminal state.
    WriteFinished { id: CloudWriteId, state: WriteState },
}

struct Entry {
    conn: ServerConnection,
    priority: usize,
    quarantined: bool,
}

/// Follow-up work deferred out of the event-draining loop.
enum CloudTask {
    Reselect,
}

struct Replica {
    server: ServerHandle,
    write: WriteId,
    state: WriteState,
}

struct CloudWrite {
    replicas: Vec<Replica>,
}

impl CloudWrite {
    /// Final state once every replica finished: the maximum over the
    /// state ordering. Zero replicas resolve `Failed`.
    fn rollup(&self) -> Option<WriteState> {
        if self.replicas.iter().any(|r| !r.state.is_terminal()) {
            return None;
        }
        Some(
            self.replicas
                .iter()
                .map(|r| r.state)
                .max()
                .unwrap_or(WriteState::Failed),
        )
    }
}

pub struct CloudConnection {
    log: Logger,
    config: CloudConfig,
    servers: Slab<Entry>,
    selected: Vec<ServerHandle>,
    quarantine_deadline: Option<u64>,
    deferred: TaskQueue<CloudTask>,
    writes: FnvHashMap<u64, CloudWrite>,
    /// (server, downstream write) -> pending cloud write
    write_index: FnvHashMap<(usize, u64), u64>,
    events: VecDeque<CloudEvent>,
    next_write_id: u64,
}

impl CloudConnection {
    pub fn new(log: Logger, config: CloudConfig) -> Self {
        Self {
            log,
            config,
            servers: Slab::new(),
            selected: Vec::new(),
            quarantine_deadline: None,
            deferred: TaskQueue::new(),
            writes: FnvHashMap::default(),
            write_index: FnvHashMap::default(),
            events: VecDeque::new(),
            next_write_id: 0,
        }
    }

    /// Register a server and reselect.
    pub fn add_server(
        &mut self,
        server: Server,
        now: u64,
        factory: &mut dyn TransportFactory,
    ) -> ServerHandle {
        let log = self.log.new(o!("server" => server.server_id.0));
        let entry = Entry {
            conn: ServerConnection::new(log, server),
            priority: 0,
            quarantined: false,
        };
        let handle = ServerHandle(self.servers.insert(entry));
        debug!(self.log, "server added"; "handle" => ?handle);
        self.reselect(now, factory);
        handle
    }

    /// Drop a server from the registry and reselect.
    pub fn remove_server(
        &mut self,
        handle: ServerHandle,
        now: u64,
        factory: &mut dyn TransportFactory,
    ) {
        if !self.servers.contains(handle.0) {
            return;
        }
        self.servers[handle.0].conn.end_connection();
        self.drain_server_events(handle);
        self.servers.remove(handle.0);
        self.selected.retain(|&h| h != handle);
        self.reselect(now, factory);
    }

    pub fn count_connections(&self) -> usize {
        self.selected.len()
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    /// Currently selected servers, best first.
    pub fn selected_servers(&self) -> &[ServerHandle] {
        &self.selected
    }

    pub fn connection(&self, handle: ServerHandle) -> Option<&ServerConnection> {
        self.servers.get(handle.0).map(|entry| &entry.conn)
    }

    pub fn stream_info(&self, handle: ServerHandle) -> Option<StreamInfo> {
        self.connection(handle).map(|conn| conn.stream_info())
    }

    /// Declare every selected server's current channel bad.
    pub fn restream(&mut self, now: u64, factory: &mut dyn TransportFactory) {
        let selected = self.selected.clone();
        for handle in selected {
            self.servers[handle.0].conn.restream(now, factory);
        }
    }

    /// Dispatch bytes according to `policy`.
    ///
    /// With an empty selected set, `MainServer` and `Priority` fail
    /// synchronously; `Replica` returns a handle that resolves `Failed`
    /// immediately with zero replicas.
    pub fn write(
        &mut self,
        policy: Policy,
        data: Bytes,
        now: u64,
    ) -> Result<CloudWriteId, WriteError> {
        let targets: Vec<ServerHandle> = match policy {
            Policy::MainServer => {
                if self.selected.is_empty() {
                    return Err(WriteError::Unwritable);
                }
                vec![self.selected[0]]
            }
            Policy::Priority(priority) => {
                if self.selected.is_empty() {
                    return Err(WriteError::Unwritable);
                }
                vec![self.selected[priority.min(self.selected.len() - 1)]]
            }
            Policy::Replica(count) => self
                .selected
                .iter()
                .take(count)
                .cloned()
                .collect(),
        };

        let id = CloudWriteId(self.next_write_id);
        self.next_write_id += 1;
        trace!(self.log, "cloud write"; "id" => id.0, "policy" => ?policy,
               "replicas" => targets.len());

        let mut replicas = Vec::with_capacity(targets.len());
        for server in targets {
            let state = match self.servers[server.0].conn.write(data.clone(), now) {
                Ok(write) => {
                    self.write_index.insert((server.0, write.0), id.0);
                    replicas.push(Replica {
                        server,
                        write,
                        state: WriteState::Queued,
                    });
                    continue;
                }
                Err(e) => {
                    debug!(self.log, "replica write failed"; "server" => ?server, "reason" => %e);
                    WriteState::Failed
                }
            };
            replicas.push(Replica {
                server,
                write: WriteId(u64::max_value()),
                state,
            });
        }

        let write = CloudWrite { replicas };
        match write.rollup() {
            // nothing left in flight: zero replicas or all failed synchronously
            Some(state) => {
                self.events
                    .push_back(CloudEvent::WriteFinished { id, state });
            }
            None => {
                self.writes.insert(id.0, write);
            }
        }
        Ok(id)
    }

    /// Forward a stop to every unfinished replica of a write.
    pub fn stop_write(&mut self, id: CloudWriteId) {
        let replicas: Vec<(ServerHandle, WriteId)> = match self.writes.get(&id.0) {
            Some(write) => write
                .replicas
                .iter()
                .filter(|r| !r.state.is_terminal())
                .map(|r| (r.server, r.write))
                .collect(),
            None => return,
        };
        for (server, write) in replicas {
            if let Some(entry) = self.servers.get_mut(server.0) {
                entry.conn.stop_write(write);
            }
        }
    }

    /// Process progress on every selected server connection.
    pub fn drive(&mut self, now: u64, factory: &mut dyn TransportFactory) {
        for task in self.deferred.steal() {
            match task {
                CloudTask::Reselect => self.reselect(now, factory),
            }
        }
        let handles: Vec<ServerHandle> = self.servers.iter().map(|(k, _)| ServerHandle(k)).collect();
        let mut failed = Vec::new();
        for handle in handles {
            {
                let entry = &mut self.servers[handle.0];
                entry.conn.drive(now, factory);
                if let Some(deadline) = entry.conn.poll_timeout() {
                    if deadline <= now {
                        entry.conn.handle_timeout(now, factory);
                    }
                }
            }
            if self.drain_server_events(handle) {
                failed.push(handle);
            }
        }
        for handle in failed {
            self.quarantine(handle, now);
        }
        if let Some(deadline) = self.quarantine_deadline {
            if deadline <= now {
                self.release_quarantine();
            }
        }
    }

    /// Next deadline the driver must honor, if any.
    pub fn poll_timeout(&self) -> Option<u64> {
        let mut deadline = self.quarantine_deadline;
        for &handle in &self.selected {
            if let Some(t) = self.servers[handle.0].conn.poll_timeout() {
                deadline = Some(match deadline {
                    Some(d) => d.min(t),
                    None => t,
                });
            }
        }
        deadline
    }

    pub fn handle_timeout(&mut self, now: u64, factory: &mut dyn TransportFactory) {
        self.drive(now, factory);
    }

    pub fn poll(&mut self) -> Option<CloudEvent> {
        self.events.pop_front()
    }

    /// Drain one server's events into cloud events; true means the server
    /// reported a fatal error and must be quarantined.
    fn drain_server_events(&mut self, handle: ServerHandle) -> bool {
        let mut failed = false;
        loop {
            let event = match self.servers.get_mut(handle.0).and_then(|e| e.conn.poll()) {
                Some(x) => x,
                None => break,
            };
            match event {
                ServerEvent::ServerError => failed = true,
                ServerEvent::StreamUpdate => {
                    // any link error leads to reselection
                    if self.servers[handle.0].conn.stream_info().link_state == LinkState::LinkError
                    {
                        failed = true;
                    }
                }
                ServerEvent::ChannelChanged => {}
                ServerEvent::Data(data) => {
                    self.events.push_back(CloudEvent::Data {
                        server: handle,
                        data,
                    });
                }
                ServerEvent::WriteFinished { id, state } => {
                    self.finish_replica(handle, id, state);
                }
            }
        }
        failed
    }

    fn finish_replica(&mut self, server: ServerHandle, write: WriteId, state: WriteState) {
        let cloud_id = match self.write_index.remove(&(server.0, write.0)) {
            Some(x) => x,
            None => return,
        };
        let rolled = {
            let cloud_write = match self.writes.get_mut(&cloud_id) {
                Some(x) => x,
                None => return,
            };
            if let Some(replica) = cloud_write
                .replicas
                .iter_mut()
                .find(|r| r.server == server && r.write == write)
            {
                replica.state = state;
            }
            cloud_write.rollup()
        };
        if let Some(state) = rolled {
            self.writes.remove(&cloud_id);
            self.events.push_back(CloudEvent::WriteFinished {
                id: CloudWriteId(cloud_id),
                state,
            });
        }
    }

    /// Candidates: non-quarantined servers by ascending priority, ties
    /// broken by server id.
    fn candidates(&self) -> Vec<ServerHandle> {
        let mut candidates: Vec<ServerHandle> = self
            .servers
            .iter()
            .filter(|&(_, entry)| !entry.quarantined)
            .map(|(k, _)| ServerHandle(k))
            .collect();
        candidates.sort_by_key(|&h| {
            let entry = &self.servers[h.0];
            (entry.priority, entry.conn.server_id())
        });
        candidates
    }

    fn reselect(&mut self, now: u64, factory: &mut dyn TransportFactory) {
        let candidates = self.candidates();
        let select_count = candidates.len().min(self.config.max_connections);
        debug!(self.log, "select servers"; "candidates" => candidates.len(),
               "count" => select_count);

        let formerly: Vec<ServerHandle> = self.selected.clone();
        self.selected = candidates[..select_count].to_vec();

        for (i, &handle) in candidates.iter().enumerate() {
            let entry = &mut self.servers[handle.0];
            entry.priority = i;
            if i < select_count {
                entry.conn.begin_connection(now, factory);
            } else {
                entry.conn.end_connection();
            }
        }
        // servers that dropped out of the registry-backed candidate list
        // entirely (quarantined) were already ended by the caller
        for handle in formerly {
            if !self.selected.contains(&handle) {
                if let Some(entry) = self.servers.get_mut(handle.0) {
                    entry.conn.end_connection();
                }
            }
        }

        self.events.push_back(CloudEvent::ServersUpdate);
    }

    fn quarantine(&mut self, handle: ServerHandle, now: u64) {
        let registry_size = self.servers.len();
        {
            let entry = match self.servers.get_mut(handle.0) {
                Some(x) => x,
                None => return,
            };
            debug!(self.log, "quarantine server"; "handle" => ?handle,
                   "priority" => entry.priority + registry_size);
            // push it past any currently usable server
            entry.priority += registry_size;
            entry.conn.end_connection();
            entry.quarantined = true;
        }
        self.drain_server_events(handle);
        if self.quarantine_deadline.is_none() {
            self.quarantine_deadline = Some(now + self.config.quarantine_duration);
        }
        self.selected.retain(|&h| h != handle);
        if self.deferred.is_empty() {
            self.deferred.enqueue(CloudTask::Reselect);
        }
    }

    fn release_quarantine(&mut self) {
        debug!(self.log, "release quarantine");
        self.quarantine_deadline = None;
        let mut released = false;
        for (_, entry) in self.servers.iter_mut() {
            if entry.quarantined {
                entry.quarantined = false;
                released = true;
            }
        }
        if released && self.selected.len() < self.config.max_connections
            && self.deferred.is_empty()
        {
            self.deferred.enqueue(CloudTask::Reselect);
        }
    }
}
