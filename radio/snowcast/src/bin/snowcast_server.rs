//! The snowcast server executable: argument parsing, startup, and the
//! operator REPL. Everything else lives in the engine.

use clap::{App, Arg};
use drift::pool::DEFAULT_WORKERS;
use drift::server::Server;
use frost::logging;
use std::fs::File;
use std::io;
use std::io::BufRead;
use std::process;

fn main() {
    let matches = App::new("snowcast_server")
        .version("1.0")
        .about("Streams song files to tuned-in listeners over UDP.")
        .arg(
            Arg::with_name("PORT")
                .help("TCP control port to listen on")
                .required(true),
        )
        .arg(
            Arg::with_name("SONGS")
                .help("Song files, one station each")
                .required(true)
                .multiple(true),
        )
        .get_matches();

    let log = logging::init();

    let port: u16 = match matches.value_of("PORT").unwrap().parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("PORT must be a number in [0, 65536)");
            process::exit(1);
        }
    };
    let songs: Vec<String> = matches
        .values_of("SONGS")
        .unwrap()
        .map(str::to_string)
        .collect();

    let listener = match frost::net::listen(port) {
        Ok(listener) => listener,
        Err(err) => {
            logging::error!(log, "failed to bind listener"; "port" => port, "error" => %err);
            process::exit(1);
        }
    };

    if let Ok(addr) = listener.local_addr() {
        logging::info!(log, "listening"; "addr" => %addr);
    }

    let server = match Server::start(listener, &songs, DEFAULT_WORKERS, &log) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "startup failed"; "error" => %err);
            process::exit(1);
        }
    };

    repl(&server, &log);

    server.shutdown();
    println!("Goodbye!");
}

/// Line-oriented operator commands on stdin. `q` or end-of-input requests
/// shutdown; `p [file]` writes the station snapshot.
fn repl(server: &Server, log: &logging::Logger) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let input = line.trim();

        if input == "q" {
            break;
        } else if input == "p" {
            let stdout = io::stdout();
            if let Err(err) = server.snapshot(&mut stdout.lock()) {
                logging::warn!(log, "snapshot failed"; "error" => %err);
            }
        } else if let Some(path) = input.strip_prefix("p ") {
            let path = path.trim();
            match File::create(path) {
                Ok(mut file) => {
                    if let Err(err) = server.snapshot(&mut file) {
                        logging::warn!(log, "snapshot failed"; "path" => path, "error" => %err);
                    }
                }
                Err(err) => {
                    logging::warn!(log, "cannot open snapshot file"; "path" => path, "error" => %err);
                }
            }
        } else if !input.is_empty() {
            println!("Commands: 'p [file]' prints the station snapshot, 'q' quits.");
        }
    }
}
