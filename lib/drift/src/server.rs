//! Lifecycle controller and control-plane jobs: startup wiring, the
//! accept/handshake and request handlers dispatched by the poller, and the
//! ordered teardown the operator triggers.

use crate::client::{Client, ClientControl, ClientRegistry};
use crate::poller;
use crate::pool::WorkerPool;
use crate::proto;
use crate::proto::{Command, ProtoError, Reply};
use crate::station::{InvalidStation, StationSet};
use frost::logging::{self, Logger};
use mio::{Poll, Ready, SetReadiness};
use std::io;
use std::io::Write;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

/// Everything the poller and the workers share.
pub struct ServerContext {
    pub(crate) log: Logger,
    pub(crate) listener: TcpListener,
    pub(crate) clients: ClientControl,
    pub(crate) stations: StationSet,
    pub(crate) pool: WorkerPool,
    pub(crate) poll: Arc<Poll>,
    stopped: AtomicBool,
    waker: SetReadiness,
}

impl ServerContext {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Accounts for one dispatched control-plane job; dropping it marks the job
/// finished on every exit path, including jobs destroyed unexecuted.
pub(crate) struct JobTicket {
    ctx: Arc<ServerContext>,
}

impl JobTicket {
    /// The caller must already have counted the job via `begin_jobs`.
    pub(crate) fn new(ctx: Arc<ServerContext>) -> JobTicket {
        JobTicket { ctx }
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        self.ctx.clients.finish_job();
    }
}

/// A running snowcast server.
pub struct Server {
    ctx: Arc<ServerContext>,
    poller: Option<JoinHandle<()>>,
}

impl Server {
    /// Brings the system up in dependency order: stations first, then the
    /// worker pool, then the registry seeded with the listener, and finally
    /// the poller.
    pub fn start(
        listener: TcpListener,
        songs: &[String],
        worker_count: usize,
        log: &Logger,
    ) -> io::Result<Server> {
        // Accepted client sockets stay blocking; only the listener itself is
        // non-blocking, so a connection that vanishes between the readiness
        // report and the accept cannot wedge the poller.
        listener.set_nonblocking(true)?;

        let stations = StationSet::new(songs, log)?;
        let pool = WorkerPool::new(worker_count, log)?;
        let (registry, poll, waker) = ClientRegistry::new(&listener)?;

        let ctx = Arc::new(ServerContext {
            log: log.new(logging::o!()),
            listener,
            clients: ClientControl::new(registry),
            stations,
            pool,
            poll,
            stopped: AtomicBool::new(false),
            waker,
        });

        let poller = {
            let ctx = ctx.clone();
            thread::Builder::new()
                .name("poller".to_string())
                .spawn(move || poller::run(ctx))?
        };

        logging::info!(ctx.log, "server started"; "stations" => ctx.stations.len());

        Ok(Server {
            ctx,
            poller: Some(poller),
        })
    }

    pub fn client_count(&self) -> usize {
        self.ctx.clients.lock().len()
    }

    /// Writes the operator snapshot: one line per station.
    pub fn snapshot<W: Write>(&self, out: &mut W) -> io::Result<()> {
        self.ctx.stations.write_snapshot(out)
    }

    /// Ordered teardown: flag, wake the poller out of its readiness call,
    /// drain the pool, join the poller, stop the pacers, close the remaining
    /// sockets, stop the workers.
    pub fn shutdown(mut self) {
        self.ctx.stopped.store(true, Ordering::Release);
        let _ = self.ctx.waker.set_readiness(Ready::readable());

        self.ctx.pool.wait_idle();
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
        // The poller's final pass may have dispatched a last round of jobs.
        self.ctx.pool.wait_idle();

        self.ctx.stations.shutdown();
        self.ctx.clients.clear();
        self.ctx.pool.shutdown();

        logging::info!(self.ctx.log, "server stopped");
    }
}

/// Accepts a single connection and runs the handshake: the first message
/// must be a Hello carrying the client's UDP port. Anything else, including
/// silence past the read deadline, closes the socket without a trace in the
/// registry.
pub(crate) fn accept_and_handshake(ctx: &Arc<ServerContext>) {
    let (stream, peer) = match ctx.listener.accept() {
        Ok(pair) => pair,
        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
        Err(err) => {
            logging::warn!(ctx.log, "accept failed"; "error" => %err);
            return;
        }
    };

    // Some platforms hand out accepted sockets that inherit the listener's
    // non-blocking mode; protocol reads rely on blocking-with-deadline.
    if stream.set_nonblocking(false).is_err() {
        return;
    }

    let udp_port = match proto::recv_command(&stream) {
        Ok(Command::Hello { udp_port }) => udp_port,
        Ok(_) | Err(_) => return,
    };

    let client = {
        let mut registry = ctx.clients.lock();
        match registry.add(stream, udp_port, peer) {
            Ok(client) => client,
            Err(err) => {
                logging::warn!(ctx.log, "client registration failed"; "peer" => %peer, "error" => %err);
                return;
            }
        }
    };

    let welcome = Reply::Welcome {
        stations: ctx.stations.len() as u16,
    };
    if proto::send_reply(client.stream(), &welcome).is_err() {
        remove_client_everywhere(ctx, &client);
        return;
    }

    logging::info!(ctx.log, "client connected"; "peer" => %peer, "udp" => %client.udp_addr());
}

/// Handles one command from a connected client. A clean close, a deadline,
/// or garbage all drop the client quietly.
pub(crate) fn handle_request(ctx: &Arc<ServerContext>, client: &Arc<Client>) {
    let command = match proto::recv_command(client.stream()) {
        Ok(command) => command,
        Err(ProtoError::Closed) => {
            logging::debug!(ctx.log, "client disconnected"; "peer" => %client.tcp_addr());
            remove_client_everywhere(ctx, client);
            return;
        }
        Err(err) => {
            logging::debug!(ctx.log, "dropping client"; "peer" => %client.tcp_addr(), "error" => %err);
            remove_client_everywhere(ctx, client);
            return;
        }
    };

    match command {
        Command::SetStation { station } => set_station(ctx, client, station),
        Command::Hello { .. } => {
            let reply =
                Reply::InvalidCommand("Already received a Hello; expected SetStation.".to_string());
            let _ = proto::send_reply(client.stream(), &reply);
            remove_client_everywhere(ctx, client);
        }
    }
}

fn set_station(ctx: &Arc<ServerContext>, client: &Arc<Client>, station: u16) {
    let outcome = {
        let registry = ctx.clients.lock();
        if registry.index_of(client).is_none() {
            return;
        }
        ctx.stations.swap(client, station as usize)
    };

    match outcome {
        Err(InvalidStation) => {
            let reason = format!(
                "Requested station {}, but server only has stations [0, {}).",
                station,
                ctx.stations.len()
            );
            let _ = proto::send_reply(client.stream(), &Reply::InvalidCommand(reason));
            remove_client_everywhere(ctx, client);
        }
        // Retuning to the current station is a silent no-op.
        Ok(false) => (),
        Ok(true) => {
            let song = ctx
                .stations
                .song_name(station as usize)
                .unwrap_or_default()
                .to_string();
            let text = format!("\"{}\" [switched to Station {}]", song, station);
            if proto::send_reply(client.stream(), &Reply::Announce(text)).is_err() {
                remove_client_everywhere(ctx, client);
                return;
            }
            logging::info!(ctx.log, "client retuned"; "peer" => %client.tcp_addr(), "station" => station);
        }
    }
}

/// Removes a client from its station's subscriber list and from the
/// registry, all under the registry lock. Absent clients are a no-op, so
/// repeated removals are safe.
pub(crate) fn remove_client_everywhere(ctx: &Arc<ServerContext>, client: &Arc<Client>) {
    let mut registry = ctx.clients.lock();
    let index = match registry.index_of(client) {
        Some(index) => index,
        None => return,
    };

    if let Some(station) = client.tuned() {
        ctx.stations.unsubscribe(station, client);
        client.set_tuned(None);
    }

    registry.remove(index);
    logging::debug!(ctx.log, "client removed"; "peer" => %client.tcp_addr());
}

#[cfg(test)]
mod tests {
    use super::*;
    use frost::logging::{o, Discard};
    use std::fs;
    use std::io::Read;
    use std::net::{TcpStream, UdpSocket};
    use std::path::PathBuf;
    use std::process;
    use std::time::{Duration, Instant};

    fn quiet() -> Logger {
        Logger::root(Discard, o!())
    }

    fn song_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("snowcast-srv-{}-{}", process::id(), name));
        fs::write(&path, contents).unwrap();
        path
    }

    fn start_server(songs: &[PathBuf]) -> (Server, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let names: Vec<String> = songs
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        let server = Server::start(listener, &names, 4, &quiet()).unwrap();
        (server, addr)
    }

    fn patient_reply(stream: &TcpStream) -> Reply {
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut reader = stream;
        proto::read_reply(&mut reader).unwrap()
    }

    /// Connects and completes the Hello/Welcome handshake.
    fn handshake(addr: std::net::SocketAddr, udp_port: u16) -> (TcpStream, u16) {
        let stream = TcpStream::connect(addr).unwrap();
        proto::send_command(&stream, &Command::Hello { udp_port }).unwrap();
        match patient_reply(&stream) {
            Reply::Welcome { stations } => (stream, stations),
            other => panic!("expected Welcome, got {:?}", other),
        }
    }

    fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn snapshot_lines(server: &Server) -> Vec<String> {
        let mut out = Vec::new();
        server.snapshot(&mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_handshake_registers_client() {
        let song = song_file("hs.mp3", b"x");
        let (server, addr) = start_server(&[song.clone()]);

        let (_stream, stations) = handshake(addr, 8080);
        assert_eq!(stations, 1);
        wait_for("registration", || server.client_count() == 1);

        server.shutdown();
        let _ = fs::remove_file(song);
    }

    #[test]
    fn test_tune_in_announces_and_streams() {
        let song = song_file("tune.mp3", b"abc");
        let (server, addr) = start_server(&[song.clone()]);

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let udp_port = receiver.local_addr().unwrap().port();

        let (stream, _) = handshake(addr, udp_port);
        proto::send_command(&stream, &Command::SetStation { station: 0 }).unwrap();

        match patient_reply(&stream) {
            Reply::Announce(text) => {
                let expected =
                    format!("\"{}\" [switched to Station 0]", song.to_string_lossy());
                assert_eq!(text, expected);
            }
            other => panic!("expected Announce, got {:?}", other),
        }

        let lines = snapshot_lines(&server);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(&format!(",127.0.0.1:{}", udp_port)));

        let mut buf = [0u8; 2048];
        let (count, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(count, 1024);

        server.shutdown();
        let _ = fs::remove_file(song);
    }

    #[test]
    fn test_invalid_station_is_reported_and_fatal() {
        let song = song_file("inv.mp3", b"x");
        let (server, addr) = start_server(&[song.clone()]);

        let (stream, _) = handshake(addr, 8080);
        proto::send_command(&stream, &Command::SetStation { station: 5 }).unwrap();

        match patient_reply(&stream) {
            Reply::InvalidCommand(reason) => {
                assert_eq!(
                    reason,
                    "Requested station 5, but server only has stations [0, 1)."
                );
            }
            other => panic!("expected InvalidCommand, got {:?}", other),
        }

        wait_for("removal", || server.client_count() == 0);

        server.shutdown();
        let _ = fs::remove_file(song);
    }

    #[test]
    fn test_hot_switch_moves_subscription() {
        let first = song_file("hot0.mp3", b"x");
        let second = song_file("hot1.mp3", b"y");
        let (server, addr) = start_server(&[first.clone(), second.clone()]);

        let (stream, stations) = handshake(addr, 8081);
        assert_eq!(stations, 2);

        proto::send_command(&stream, &Command::SetStation { station: 0 }).unwrap();
        patient_reply(&stream);

        let lines = snapshot_lines(&server);
        assert!(lines[0].contains(":8081"));
        assert!(!lines[1].contains(":8081"));

        proto::send_command(&stream, &Command::SetStation { station: 1 }).unwrap();
        patient_reply(&stream);

        let lines = snapshot_lines(&server);
        assert!(!lines[0].contains(":8081"));
        assert!(lines[1].contains(":8081"));

        server.shutdown();
        let _ = fs::remove_file(first);
        let _ = fs::remove_file(second);
    }

    #[test]
    fn test_disconnect_unsubscribes() {
        let song = song_file("bye.mp3", b"x");
        let (server, addr) = start_server(&[song.clone()]);

        let (stream, _) = handshake(addr, 8082);
        proto::send_command(&stream, &Command::SetStation { station: 0 }).unwrap();
        patient_reply(&stream);

        drop(stream);
        wait_for("disconnect cleanup", || server.client_count() == 0);

        let lines = snapshot_lines(&server);
        assert!(!lines[0].contains(":8082"));

        server.shutdown();
        let _ = fs::remove_file(song);
    }

    #[test]
    fn test_silent_client_is_dropped_before_welcome() {
        let song = song_file("mute.mp3", b"x");
        let (server, addr) = start_server(&[song.clone()]);

        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        // Nothing sent within the deadline: no Welcome, no registration.
        let mut reader = &stream;
        let mut buf = [0u8; 8];
        let count = reader.read(&mut buf).unwrap();
        assert_eq!(count, 0);
        assert_eq!(server.client_count(), 0);

        server.shutdown();
        let _ = fs::remove_file(song);
    }

    #[test]
    fn test_second_hello_is_rejected() {
        let song = song_file("dup.mp3", b"x");
        let (server, addr) = start_server(&[song.clone()]);

        let (stream, _) = handshake(addr, 8083);
        proto::send_command(&stream, &Command::Hello { udp_port: 8083 }).unwrap();

        match patient_reply(&stream) {
            Reply::InvalidCommand(_) => (),
            other => panic!("expected InvalidCommand, got {:?}", other),
        }
        wait_for("removal", || server.client_count() == 0);

        server.shutdown();
        let _ = fs::remove_file(song);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let first = song_file("down0.mp3", b"x");
        let second = song_file("down1.mp3", b"y");
        let (server, addr) = start_server(&[first.clone(), second.clone()]);

        let mut streams = Vec::new();
        for (port, station) in [(9001u16, 0u16), (9002, 1), (9003, 1)].iter() {
            let (stream, _) = handshake(addr, *port);
            proto::send_command(&stream, &Command::SetStation { station: *station }).unwrap();
            patient_reply(&stream);
            streams.push(stream);
        }

        assert_eq!(server.client_count(), 3);
        server.shutdown();

        // Every client socket observes the close.
        for stream in &streams {
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            let mut reader = stream;
            let mut buf = [0u8; 8];
            assert_eq!(reader.read(&mut buf).unwrap(), 0);
        }

        let _ = fs::remove_file(first);
        let _ = fs::remove_file(second);
    }
}
