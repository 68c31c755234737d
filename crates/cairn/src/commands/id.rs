//! Id command - session token encoding and decoding.

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use console::Style;

use cairn_session::{IdCodec, ParsedId};

use super::Context;

/// Arguments for the id command.
#[derive(Args, Debug)]
pub struct IdArgs {
    #[command(subcommand)]
    pub command: IdCommand,
}

#[derive(Subcommand, Debug)]
pub enum IdCommand {
    /// Split a token into version, base id and clone chain
    Decode {
        /// Raw token as received in a cookie or URL
        token: String,
    },

    /// Build a token from its parts
    #[command(disable_version_flag = true)]
    Encode {
        /// Base session id
        #[arg(long)]
        id: String,

        /// Version number (0 omits the prefix)
        #[arg(long, default_value_t = 0)]
        version: u32,

        /// Clone chain, tokens joined by the configured separator
        #[arg(long)]
        chain: Option<String>,
    },
}

/// Run the id command.
pub async fn run(args: IdArgs, ctx: &Context) -> Result<()> {
    let codec = IdCodec::from_config(&ctx.manager_config()?);
    match args.command {
        IdCommand::Decode { token } => cmd_decode(ctx, &codec, &token),
        IdCommand::Encode { id, version, chain } => {
            cmd_encode(ctx, &codec, &id, version, chain.as_deref())
        }
    }
}

fn cmd_decode(ctx: &Context, codec: &IdCodec, token: &str) -> Result<()> {
    let Some(parsed) = codec.decode(token) else {
        bail!("'{token}' is not a well-formed session token");
    };

    if ctx.json_output {
        let clones = parsed
            .clone_chain
            .as_deref()
            .map(|c| codec.split_chain(c))
            .unwrap_or_default();
        println!(
            "{}",
            serde_json::json!({
                "version": parsed.version,
                "base_id": parsed.base_id,
                "clone_chain": parsed.clone_chain,
                "clones": clones,
            })
        );
    } else {
        print_parsed(codec, &parsed);
    }
    Ok(())
}

fn print_parsed(codec: &IdCodec, parsed: &ParsedId) {
    let dim = Style::new().dim();
    println!("  {} {}", dim.apply_to("version:"), parsed.version);
    println!("  {} {}", dim.apply_to("base id:"), parsed.base_id);
    match parsed.clone_chain {
        Some(ref chain) => println!(
            "  {} {}",
            dim.apply_to("clones: "),
            codec.split_chain(chain).join(" → ")
        ),
        None => println!("  {} (none)", dim.apply_to("clones: ")),
    }
}

fn cmd_encode(
    ctx: &Context,
    codec: &IdCodec,
    id: &str,
    version: u32,
    chain: Option<&str>,
) -> Result<()> {
    let Some(token) = codec.encode_checked(version, id, chain) else {
        bail!(
            "refusing to encode: value contains unsafe characters or exceeds {} characters",
            codec.max_length()
        );
    };

    if ctx.json_output {
        println!("{}", serde_json::json!({ "token": token }));
    } else {
        println!("{token}");
    }
    Ok(())
}
