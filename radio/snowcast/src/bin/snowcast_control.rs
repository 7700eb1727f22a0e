//! Interactive control client: completes the Hello/Welcome handshake, then
//! turns typed station numbers into SetStation commands and prints the
//! server's announcements.

use clap::{App, Arg};
use drift::proto;
use drift::proto::{Command, ProtoError, Reply};
use std::io;
use std::io::BufRead;
use std::io::Write;
use std::net::TcpStream;
use std::process;
use std::time::Duration;

/// Replies to an interactive command get a much more generous deadline than
/// the server grants its clients.
const REPLY_DEADLINE: Duration = Duration::from_secs(1);

fn main() {
    let matches = App::new("snowcast_control")
        .version("1.0")
        .about("Tunes a snowcast listener between stations.")
        .arg(
            Arg::with_name("SERVER_NAME")
                .help("Server host name or address")
                .required(true),
        )
        .arg(
            Arg::with_name("SERVER_PORT")
                .help("Server TCP control port")
                .required(true),
        )
        .arg(
            Arg::with_name("LISTENER_PORT")
                .help("Local UDP port the listener process receives on")
                .required(true),
        )
        .get_matches();

    let host = matches.value_of("SERVER_NAME").unwrap();
    let port: u16 = parse_port(matches.value_of("SERVER_PORT").unwrap(), "SERVER_PORT");
    let listener_port: u16 =
        parse_port(matches.value_of("LISTENER_PORT").unwrap(), "LISTENER_PORT");

    let stream = match TcpStream::connect((host, port)) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("Could not connect to server {}:{}: {}", host, port, err);
            process::exit(1);
        }
    };

    if proto::send_command(&stream, &Command::Hello { udp_port: listener_port }).is_err() {
        eprintln!("Failed to send Hello to the server. Shutting down...");
        process::exit(1);
    }

    match await_reply(&stream) {
        Ok(Reply::Welcome { stations }) => {
            println!(
                "Welcome to Snowcast! The server has {} station(s).",
                stations
            );
        }
        _ => {
            eprintln!("Server sent an invalid reply. Shutting down...");
            process::exit(1);
        }
    }

    println!("Type in a number to set the station on which we're listening.");
    println!("Type in 'q', Ctrl-D, or Ctrl-C to quit.");

    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => (),
        }
        let input = line.trim();

        if input == "q" {
            break;
        }
        if input.is_empty() {
            continue;
        }

        let station: u16 = match input.parse() {
            Ok(station) => station,
            Err(_) => {
                println!("Type a station number, or 'q' to quit.");
                continue;
            }
        };

        if proto::send_command(&stream, &Command::SetStation { station }).is_err() {
            eprintln!("Failed to send message to server.");
            break;
        }
        println!("Waiting for an announce...");

        match await_reply(&stream) {
            Ok(Reply::Announce(song)) => println!("New song announced: {}", song),
            Ok(Reply::InvalidCommand(reason)) => {
                eprintln!("INVALID_COMMAND_REPLY: {}", reason);
                break;
            }
            Ok(_) => {
                eprintln!("Server sent an invalid reply. Shutting down...");
                break;
            }
            // Retuning to the current station is answered with silence.
            Err(ProtoError::Timeout) => println!("No announce received."),
            Err(err) => {
                eprintln!("Lost the server: {}", err);
                break;
            }
        }
    }
}

fn parse_port(text: &str, what: &str) -> u16 {
    match text.parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("{} must be a number in [0, 65536)", what);
            process::exit(1);
        }
    }
}

fn await_reply(stream: &TcpStream) -> Result<Reply, ProtoError> {
    stream.set_read_timeout(Some(REPLY_DEADLINE))?;
    let mut reader = stream;
    proto::read_reply(&mut reader)
}
