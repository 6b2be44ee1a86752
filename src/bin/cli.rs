use clap::{Parser, Subcommand};

use kvpool::{
    conf::Configuration,
    net::{Client, Request},
    telemetry::{get_subscriber, init_subscriber},
};

/// A minimal client for RESP key-value servers.
#[derive(Parser)]
#[clap(name = "kvpool-cli", version, author, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    cmd: Commands,

    /// The host address of the server.
    #[clap(long)]
    host: Option<String>,

    /// The port number of the server.
    #[clap(long)]
    port: Option<u16>,

    /// Path to a configuration file.
    #[clap(long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the server answers.
    Ping,

    /// Get key's value.
    Get {
        #[clap(name = "KEY")]
        key: String,
    },

    /// Set key's value.
    Set {
        #[clap(name = "KEY")]
        key: String,
        #[clap(name = "VALUE")]
        value: String,
    },

    /// Delete keys.
    Del {
        #[clap(name = "KEY", required = true)]
        keys: Vec<String>,
    },

    /// Increment key's value.
    Incr {
        #[clap(name = "KEY")]
        key: String,
    },

    /// Send any command and print the reply.
    Raw {
        #[clap(name = "ARGS", required = true)]
        args: Vec<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    // stdout is reserved for replies
    let subscriber = get_subscriber("kvpool-cli".into(), "warn".into(), std::io::stderr);
    init_subscriber(subscriber)?;

    let cli = Cli::parse();

    let mut conf = match &cli.config {
        Some(path) => Configuration::get(path)?,
        None => Configuration::discover()?,
    };
    if let Some(host) = cli.host {
        conf.client.host = host;
    }
    if let Some(port) = cli.port {
        conf.client.port = port;
    }

    let client = Client::connect(&conf.client).await?;
    match cli.cmd {
        Commands::Ping => {
            client.ping().await?;
            println!("PONG");
        }
        Commands::Get { key } => match client.get(key).await? {
            Some(val) => println!("\"{}\"", val.escape_ascii()),
            None => println!("(nil)"),
        },
        Commands::Set { key, value } => {
            client.set(key, value).await?;
            println!("OK");
        }
        Commands::Del { keys } => {
            let n_deleted = client.del(keys).await?;
            println!("(integer) {}", n_deleted);
        }
        Commands::Incr { key } => {
            let n = client.incr(key).await?;
            println!("(integer) {}", n);
        }
        Commands::Raw { args } => {
            let reply = client.send(args.into_iter().collect::<Request>()).await?;
            println!("{}", reply);
        }
    }
    client.close()?;

    Ok(())
}
