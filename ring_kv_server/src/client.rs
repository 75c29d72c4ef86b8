use ring_kv_core::protocol::{ClientRequest, ClientResponse};
use ring_kv_core::KvClient;
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn run_client(address: &str) -> anyhow::Result<()> {
    println!("Connected to {}. Commands: get, put, keyrange, keyrange_read, stats, quit", address);
    let mut client = KvClient::new(address);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("ring_kv> ");
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command.eq_ignore_ascii_case("quit") {
            break;
        }

        let request = match command.parse::<ClientRequest>() {
            Ok(request) => request,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        match client.execute(request).await {
            Ok(response) => display_response(&response),
            Err(e) => println!("error: {}", e),
        }
    }

    println!("Goodbye!");
    Ok(())
}

fn display_response(response: &ClientResponse) {
    match response {
        ClientResponse::KeyRangeSuccess { ranges } | ClientResponse::KeyRangeReadSuccess { ranges } => {
            println!("{}", response.status());
            for entry in ranges.split(';') {
                println!("  {}", entry);
            }
        }
        other => println!("{}", other),
    }
}
