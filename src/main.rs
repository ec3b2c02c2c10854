use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use sqz::compress::{M_LZMA, M_STORE, M_XZ};
use sqz::{pack, unpack, PackOptions, UnpackOutcome};

#[derive(Parser)]
#[command(name = "sqz", version, about = "Compress ELF executables in place")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,

    /// Print sizes and ratios.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Cmd {
    /// Compress an executable or shared library.
    Pack {
        file: PathBuf,
        /// Output path; defaults to FILE.sqz.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Force a single method instead of trying them all (lzma, xz, store).
        #[arg(long)]
        method: Option<String>,
        /// Skip the byte-filter trials.
        #[arg(long)]
        no_filter: bool,
        /// Shared libraries: splice an auxiliary header page at the code
        /// boundary.
        #[arg(long)]
        aux_page: bool,
        /// Maximum uncompressed block size in bytes.
        #[arg(long)]
        block_size: Option<u32>,
    },
    /// Restore the original file from a packed one.
    Unpack {
        file: PathBuf,
        /// Output path; defaults to FILE with the .sqz suffix stripped.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Pack and unpack in memory, then compare against the input.
    Test { file: PathBuf },
}

fn parse_methods(name: &str) -> Result<Vec<u8>, String> {
    match name {
        "lzma" => Ok(vec![M_LZMA]),
        "xz" => Ok(vec![M_XZ]),
        "store" => Ok(vec![M_STORE]),
        other => Err(format!("unknown method {:?} (expected lzma, xz or store)", other)),
    }
}

fn write_like(out: &Path, data: &[u8], original: &Path) -> std::io::Result<()> {
    fs::write(out, data)?;
    // The packed file must stay executable.
    fs::set_permissions(out, fs::metadata(original)?.permissions())
}

fn packed_name(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(".sqz");
    PathBuf::from(name)
}

fn restored_name(file: &Path) -> PathBuf {
    match file.extension().and_then(|e| e.to_str()) {
        Some("sqz") => file.with_extension(""),
        _ => {
            let mut name = file.as_os_str().to_os_string();
            name.push(".out");
            PathBuf::from(name)
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    match cli.cmd {
        Cmd::Pack { file, output, method, no_filter, aux_page, block_size } => {
            let input = fs::read(&file).map_err(|e| format!("{}: {}", file.display(), e))?;
            let mut opts = PackOptions::default();
            if let Some(name) = method {
                opts.methods = parse_methods(&name)?;
            }
            if let Some(bs) = block_size {
                if bs == 0 {
                    return Err("block size must be nonzero".into());
                }
                opts.block_size = bs;
            }
            opts.allow_filter = !no_filter;
            opts.aux_page = aux_page;

            let packed = pack(&input, &opts).map_err(|e| e.to_string())?;
            let out = output.unwrap_or_else(|| packed_name(&file));
            write_like(&out, &packed, &file).map_err(|e| e.to_string())?;
            if cli.verbose {
                println!(
                    "{}: {} -> {} bytes ({:.1}%)",
                    out.display(),
                    input.len(),
                    packed.len(),
                    100.0 * packed.len() as f64 / input.len() as f64
                );
            }
            Ok(())
        }
        Cmd::Unpack { file, output } => {
            let input = fs::read(&file).map_err(|e| format!("{}: {}", file.display(), e))?;
            let restored = unpack(&input).map_err(|e| e.to_string())?;
            if cli.verbose && restored.outcome == UnpackOutcome::Recovered {
                println!("{}: stream resynchronized during recovery", file.display());
            }
            let out = output.unwrap_or_else(|| restored_name(&file));
            write_like(&out, &restored.data, &file).map_err(|e| e.to_string())?;
            if cli.verbose {
                println!("{}: {} bytes restored", out.display(), restored.data.len());
            }
            Ok(())
        }
        Cmd::Test { file } => {
            let input = fs::read(&file).map_err(|e| format!("{}: {}", file.display(), e))?;
            let packed = pack(&input, &PackOptions::default()).map_err(|e| e.to_string())?;
            let restored = unpack(&packed).map_err(|e| e.to_string())?;
            if restored.data != input {
                return Err(format!("{}: round trip mismatch", file.display()));
            }
            println!(
                "{}: ok, {} -> {} bytes ({:.1}%)",
                file.display(),
                input.len(),
                packed.len(),
                100.0 * packed.len() as f64 / input.len() as f64
            );
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("sqz: {}", msg);
            ExitCode::FAILURE
        }
    }
}
