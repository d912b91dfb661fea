use unveil::*;

use std::path::PathBuf;

use clap::Parser;

/// Strip interpreter-style obfuscation from binary functions
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Analyze functions from an exported pcode listing
    FromListing {
        /// Path to an exported pcode listing (see `lifter` module docs for the format)
        exported_pcode: PathBuf,
        /// Path to output file for the optimized listing; stdout when absent
        #[clap(long)]
        output: Option<PathBuf>,
        /// Output every function's CFG as GraphViz `.dot` to the given path
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Print lattice values next to varnodes in the listing
        #[clap(long)]
        show_values: bool,
        /// Print def/use chains under each op
        #[clap(long)]
        show_ud: bool,
        /// Append the dead-op graveyard to the listing
        #[clap(long)]
        show_dead: bool,
        /// Stack safe-zone size in bytes below the entry stack pointer
        #[clap(long)]
        safezone: Option<u64>,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for
        /// normal use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the
        /// logger, by default, does not block, but instead dumps a dropped-messages alert. This
        /// option forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in
        /// addition to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak the analysis behavior
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<config::CommandLineAnalysisConfig>,
    },
}

fn main() {
    let args = Args::parse();

    match args {
        Args::FromListing {
            exported_pcode,
            output,
            debug_output_graphviz,
            show_values,
            show_ud,
            show_dead,
            safezone,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let _log_guard = slog_scope::set_global_logger(crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ));

            config::AnalysisConfig::initialize(advanced_config);

            let listing = lifter::parse_listing(
                &std::fs::read_to_string(exported_pcode).expect("pcode file could not be read"),
            )
            .expect("pcode listing could not be parsed");

            let mut engine = engine::Engine::new(engine::RegisterSet::arm32())
                .expect("default register model is valid");
            for (base, bytes) in listing.decoder.memory_sections() {
                engine.add_memory(*base, bytes.clone());
            }
            engine.set_decoder(Box::new(listing.decoder));
            if let Some(size) = safezone {
                engine.set_default_safezone(-(size as i128), size as i128);
            }
            for (name, addr) in &listing.functions {
                engine.add_function(name, *addr);
            }
            let completed = engine.run();
            log::info!("analysis finished";
                "functions" => engine.functions.len(),
                "completed" => completed);

            let mut flags = 0u32;
            if show_values {
                flags |= dump::DUMP_VAL;
            }
            if show_ud {
                flags |= dump::DUMP_UD
                    | dump::OMIT_MORE_USE
                    | dump::OMIT_MORE_DEF
                    | dump::OMIT_MORE_IN;
            }
            if show_dead {
                flags |= dump::DUMP_DEAD;
            }

            let mut listing_text = String::new();
            for fd in &engine.functions {
                if fd.flags.no_code {
                    continue;
                }
                listing_text.push_str(&dump::dump_pcode(fd, flags));
                listing_text.push('\n');
            }
            if let Some(path) = output {
                use std::io::Write;
                write!(std::fs::File::create(path).unwrap(), "{}", listing_text).unwrap();
            } else {
                println!("{}", listing_text);
            }

            if let Some(path) = debug_output_graphviz {
                let mut file = std::fs::File::create(path).unwrap();
                for fd in &engine.functions {
                    if fd.flags.blocks_generated {
                        dump::render_cfg(fd, flags, &mut file).unwrap();
                    }
                }
            }

            log::trace!("Done");
        }
    }
}
