use clap::{Parser, Subcommand};
use merhash::{CompactedQuery, CompactedReader, CountArray, encode};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::PathBuf;

/// Count k-mers into a compacted file, or query one.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Count k-mers of FASTA-ish input (headers skipped) into a compacted file.
    Count {
        /// Input sequence path
        #[arg(short, long)]
        input: PathBuf,

        /// Output compacted path
        #[arg(short, long)]
        output: PathBuf,

        /// K-mer length (<= 32)
        #[arg(short = 'k', long)]
        k: usize,

        /// log2 of the table size
        #[arg(short = 's', long, default_value_t = 22)]
        lsize: u32,

        /// Live counter width in bits
        #[arg(long, default_value_t = 7)]
        val_bits: u32,

        /// Reprobe limit
        #[arg(long, default_value_t = 62)]
        reprobe: u32,

        /// Disable canonicalization
        #[arg(long, default_value_t = false)]
        no_canonical: bool,
    },
    /// Look up k-mers in a compacted file.
    Query {
        /// Compacted file path
        #[arg(short, long)]
        file: PathBuf,

        /// Canonicalize looked-up k-mers
        #[arg(long, default_value_t = false)]
        canonical: bool,

        /// K-mers to look up
        mers: Vec<String>,
    },
    /// Print the statistics header of a compacted file.
    Stats {
        /// Compacted file path
        #[arg(short, long)]
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    match Args::parse().cmd {
        Cmd::Count {
            input,
            output,
            k,
            lsize,
            val_bits,
            reprobe,
            no_canonical,
        } => count(input, output, k, lsize, val_bits, reprobe, !no_canonical),
        Cmd::Query {
            file,
            canonical,
            mers,
        } => query(file, canonical, &mers),
        Cmd::Stats { file } => stats(file),
    }
}

fn count(
    input: PathBuf,
    output: PathBuf,
    k: usize,
    lsize: u32,
    val_bits: u32,
    reprobe: u32,
    canonical: bool,
) -> anyhow::Result<()> {
    anyhow::ensure!(k > 0 && k <= 32, "k must be 1..=32");
    let ary = CountArray::new(1u64 << lsize, 2 * k as u32, val_bits, reprobe)?;

    let reader = BufReader::new(File::open(&input)?);
    let mut mers = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.starts_with('>') || line.starts_with('@') || line.starts_with('+') {
            continue;
        }
        mers += count_line(&ary, line.as_bytes(), k, canonical)?;
    }

    let out = BufWriter::new(File::create(&output)?);
    let distinct = merhash::dump(&ary, out)?;
    eprintln!(
        "[mh] counted {mers} mers, {distinct} distinct, k={k}, size=2^{lsize}, canonical={canonical}"
    );
    Ok(())
}

/// Rolling 2-bit scan; ambiguous bases reset the window.
fn count_line(ary: &CountArray, seq: &[u8], k: usize, canonical: bool) -> anyhow::Result<u64> {
    let mask: u64 = if k == 32 { u64::MAX } else { (1u64 << (2 * k)) - 1 };
    let mut fwd = 0u64;
    let mut rc = 0u64;
    let mut len = 0usize;
    let mut mers = 0u64;

    for &b in seq {
        let Some(v) = encode::map_base(b) else {
            fwd = 0;
            rc = 0;
            len = 0;
            continue;
        };
        let v = v as u64;
        fwd = ((fwd << 2) | v) & mask;
        rc = (rc >> 2) | ((v ^ 0b11) << (2 * (k - 1)));
        len += 1;

        if len >= k {
            let code = if canonical { fwd.min(rc) } else { fwd };
            anyhow::ensure!(
                ary.add(code, 1),
                "table full; rerun with a larger --lsize"
            );
            mers += 1;
        }
    }
    Ok(mers)
}

fn query(file: PathBuf, canonical: bool, mers: &[String]) -> anyhow::Result<()> {
    let q = CompactedQuery::open(&file, canonical)?;
    let k = q.mer_len() as usize;
    for mer in mers {
        anyhow::ensure!(mer.len() == k, "'{mer}' is not a {k}-mer");
        let code = encode::encode_kmer(mer.as_bytes())
            .ok_or_else(|| anyhow::anyhow!("'{mer}' contains non-ACGT bases"))?;
        println!("{mer} {}", q.lookup(code)?);
    }
    Ok(())
}

fn stats(file: PathBuf) -> anyhow::Result<()> {
    let r = CompactedReader::open(&file)?;
    println!("mer length:    {}", r.mer_len());
    println!("key bits:      {}", r.key_bits());
    println!("value bytes:   {}", r.val_bytes());
    println!("table size:    {}", r.size());
    println!("reprobe limit: {}", r.reprobe_limit());
    println!("unique:        {}", r.unique());
    println!("distinct:      {}", r.distinct());
    println!("total:         {}", r.total());
    println!("max count:     {}", r.max_count());
    Ok(())
}
