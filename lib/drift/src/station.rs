//! Stations and their pacers. Each station owns a looping song file and
//! broadcasts fixed-size chunks to its subscribers on a fixed wall-clock
//! cadence, independent of every other station.

use crate::client::Client;
use frost::logging::{self, Logger};
use parking_lot::Mutex;
use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// One sixteenth of the nominal 16 KiB per-second budget.
pub const CHUNK_SIZE: usize = 1024;

/// Wall-clock spacing between chunks: 16 chunks per second.
pub const CHUNK_INTERVAL: Duration = Duration::from_micros(62_500);

/// Returned by [`StationSet::swap`] for a station index outside the set.
#[derive(Debug, Error, Eq, PartialEq)]
#[error("no such station")]
pub struct InvalidStation;

/// Cursor over a song file that rewinds at end-of-file, so playback loops
/// seamlessly.
pub(crate) struct SongReader {
    file: File,
}

impl SongReader {
    pub(crate) fn open(path: &Path) -> io::Result<SongReader> {
        Ok(SongReader {
            file: File::open(path)?,
        })
    }

    /// Fills `chunk` completely, rewinding as many times as the file
    /// requires. A file that yields no bytes when more are needed cannot be
    /// streamed.
    pub(crate) fn fill(&mut self, chunk: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        let mut stalled = false;
        while filled < chunk.len() {
            let count = self.file.read(&mut chunk[filled..])?;
            if count == 0 {
                if stalled {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "song file yielded no data",
                    ));
                }
                self.file.seek(SeekFrom::Start(0))?;
                stalled = true;
            } else {
                filled += count;
                stalled = false;
            }
        }
        Ok(())
    }
}

struct StationShared {
    index: usize,
    song_name: String,
    subscribers: Mutex<Vec<Arc<Client>>>,
    stop: AtomicBool,
}

/// A logical radio channel. The subscriber list is mutated by control-plane
/// work; the song file, chunk buffer, and sending sockets belong to the
/// pacer thread alone.
pub struct Station {
    shared: Arc<StationShared>,
    pacer: Mutex<Option<JoinHandle<()>>>,
}

impl Station {
    /// Opens the song file and both sending sockets, then starts the pacer.
    pub fn new(index: usize, song: &str, log: &Logger) -> io::Result<Station> {
        let reader = SongReader::open(Path::new(song))?;
        let (socket_v4, socket_v6) = frost::net::udp_sender_pair()?;

        let shared = Arc::new(StationShared {
            index,
            song_name: song.to_string(),
            subscribers: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        });

        let pacer = {
            let shared = shared.clone();
            let log = log.new(logging::o!("station" => index));
            thread::Builder::new()
                .name(format!("pacer-{}", index))
                .spawn(move || pace(shared, reader, socket_v4, socket_v6, log))?
        };

        Ok(Station {
            shared,
            pacer: Mutex::new(Some(pacer)),
        })
    }

    pub fn song_name(&self) -> &str {
        &self.shared.song_name
    }

    /// Stops the pacer and drops every subscriber reference. Idempotent.
    fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.pacer.lock().take() {
            let _ = handle.join();
        }
        self.shared.subscribers.lock().clear();
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The pacer loop: read one chunk, fan it out, then sleep off whatever is
/// left of the 62.5 ms budget.
fn pace(
    shared: Arc<StationShared>,
    mut reader: SongReader,
    socket_v4: UdpSocket,
    socket_v6: UdpSocket,
    log: Logger,
) {
    let mut chunk = [0u8; CHUNK_SIZE];

    while !shared.stop.load(Ordering::Acquire) {
        let start = Instant::now();

        if let Err(err) = reader.fill(&mut chunk) {
            logging::error!(log, "pacer halted"; "song" => %shared.song_name, "error" => %err);
            return;
        }

        {
            let subscribers = shared.subscribers.lock();
            for client in subscribers.iter() {
                let target = client.udp_addr();
                let socket = if target.is_ipv4() { &socket_v4 } else { &socket_v6 };
                // A failed send is logged and the subscriber kept; only a TCP
                // failure removes a client.
                if let Err(err) = send_chunk(socket, &chunk, target) {
                    logging::warn!(log, "chunk send failed"; "target" => %target, "error" => %err);
                }
            }
        }

        let elapsed = start.elapsed();
        if elapsed < CHUNK_INTERVAL {
            thread::sleep(CHUNK_INTERVAL - elapsed);
        }
    }
}

fn send_chunk(socket: &UdpSocket, chunk: &[u8], target: SocketAddr) -> io::Result<usize> {
    let mut sent = 0;
    while sent < chunk.len() {
        sent += socket.send_to(&chunk[sent..], target)?;
    }
    Ok(sent)
}

/// The fixed set of stations created at startup.
pub struct StationSet {
    stations: Vec<Station>,
}

impl StationSet {
    pub fn new(songs: &[String], log: &Logger) -> io::Result<StationSet> {
        let mut stations = Vec::with_capacity(songs.len());
        for (index, song) in songs.iter().enumerate() {
            stations.push(Station::new(index, song, log)?);
        }
        Ok(StationSet { stations })
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn song_name(&self, index: usize) -> Option<&str> {
        self.stations.get(index).map(Station::song_name)
    }

    /// Moves `client` to `new_station`, keeping the membership invariant: a
    /// tuned client appears in exactly one subscriber list, that of its
    /// current station. The caller holds the registry lock so the client
    /// cannot be destroyed mid-move. Returns whether anything changed;
    /// retuning to the current station is a no-op.
    pub fn swap(&self, client: &Arc<Client>, new_station: usize) -> Result<bool, InvalidStation> {
        if new_station >= self.stations.len() {
            return Err(InvalidStation);
        }

        match client.tuned() {
            None => {
                self.stations[new_station]
                    .shared
                    .subscribers
                    .lock()
                    .push(client.clone());
                client.set_tuned(Some(new_station));
                Ok(true)
            }
            Some(old) if old == new_station => Ok(false),
            Some(old) => {
                // Both list locks, lower station index first.
                let (first, second) = if old < new_station {
                    (old, new_station)
                } else {
                    (new_station, old)
                };
                let mut first_list = self.stations[first].shared.subscribers.lock();
                let mut second_list = self.stations[second].shared.subscribers.lock();

                {
                    let old_list = if old == first {
                        &mut *first_list
                    } else {
                        &mut *second_list
                    };
                    if let Some(position) =
                        old_list.iter().position(|sub| Arc::ptr_eq(sub, client))
                    {
                        old_list.remove(position);
                    }
                }

                let new_list = if new_station == first {
                    &mut *first_list
                } else {
                    &mut *second_list
                };
                new_list.push(client.clone());

                client.set_tuned(Some(new_station));
                Ok(true)
            }
        }
    }

    /// Unlinks `client` from `station`'s subscriber list, if present.
    pub fn unsubscribe(&self, station: usize, client: &Arc<Client>) {
        if let Some(entry) = self.stations.get(station) {
            let mut subscribers = entry.shared.subscribers.lock();
            if let Some(position) = subscribers.iter().position(|sub| Arc::ptr_eq(sub, client)) {
                subscribers.remove(position);
            }
        }
    }

    /// One line per station: `index,song[,udp_addr]*`.
    pub fn write_snapshot<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for station in &self.stations {
            write!(out, "{},{}", station.shared.index, station.shared.song_name)?;
            for client in station.shared.subscribers.lock().iter() {
                write!(out, ",{}", client.udp_addr())?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Stops every pacer and clears every subscriber list.
    pub fn shutdown(&self) {
        for station in &self.stations {
            station.stop();
        }
    }
}
