use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kvpipe::config::Config;
use kvpipe::connection::Link;
use kvpipe::{AsyncConnection, Command, Error, Frame, Pipeline, ReplyKind, Transaction};

const HOST: &str = "127.0.0.1";
const PORT: u16 = 6379;

/// Sends commands in a single round trip, optionally wrapped in MULTI/EXEC.
#[derive(Parser, Debug)]
struct Args {
    /// The host to connect to
    #[arg(long, env = "KVPIPE_HOST", default_value = HOST)]
    host: String,

    /// The port to connect to
    #[arg(short, long, env = "KVPIPE_PORT", default_value_t = PORT)]
    port: u16,

    /// Run the commands as one transaction
    #[arg(short, long)]
    transaction: bool,

    /// Keys to WATCH before the transaction starts
    #[arg(short, long, num_args = 1.., requires = "transaction")]
    watch: Vec<String>,

    /// Commands to send, one per argument, e.g. "SET key value"
    #[arg(required = true)]
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let commands = args
        .commands
        .iter()
        .map(|line| {
            Command::parse_line(line)
                .ok_or_else(|| Error::InvalidUsage(format!("empty command {:?}", line)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut conn = AsyncConnection::connect((args.host.as_str(), args.port), &config).await?;
    info!(connection_id = %conn.id(), host = %args.host, port = args.port, "connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Frame)>();
    let reply_to = |index: usize| {
        let tx = tx.clone();
        move |frame| {
            let _ = tx.send((index, frame));
        }
    };

    if args.transaction {
        if !args.watch.is_empty() {
            conn.watch(args.watch.clone()).await?;
        }

        let mut transaction = Transaction::new(&mut conn);
        for (i, command) in commands.iter().enumerate() {
            transaction.queue_command(command, ReplyKind::Any, reply_to(i))?;
        }

        let committed = transaction.commit_async().await;
        drop(transaction);
        print_replies(&commands, &mut rx);

        if !committed? {
            println!("(aborted: a watched key was modified)");
        }
    } else {
        let mut pipeline = Pipeline::new(&mut conn);
        for (i, command) in commands.iter().enumerate() {
            pipeline.enqueue_command(command, ReplyKind::Any, reply_to(i))?;
        }

        let flushed = pipeline.flush_async().await;
        print_replies(&commands, &mut rx);
        flushed?;
    }

    Ok(())
}

fn print_replies(commands: &[Command], rx: &mut mpsc::UnboundedReceiver<(usize, Frame)>) {
    while let Ok((index, frame)) = rx.try_recv() {
        println!("{}) {} => {}", index + 1, commands[index], frame);
    }
}
