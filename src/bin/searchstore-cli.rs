//! searchstore command line tool: create and inspect storages

use anyhow::{anyhow, bail, Context, Result};
use searchstore::types::ScalarValue;
use searchstore::{Storage, StorageConfig};
use std::env;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }
    match args[1].as_str() {
        "--version" | "-v" => {
            println!("searchstore v{}", VERSION);
            Ok(())
        }
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        "create" => {
            let config = args
                .get(2)
                .ok_or_else(|| anyhow!("usage: searchstore-cli create <config>"))?;
            let config = StorageConfig::parse(config).context("parsing storage config")?;
            Storage::create(&config).context("creating storage")?;
            println!("storage created at '{}'", config.path);
            Ok(())
        }
        "inspect" => {
            let config = args
                .get(2)
                .ok_or_else(|| anyhow!("usage: searchstore-cli inspect <config> <what> ..."))?;
            let config = StorageConfig::parse(config).context("parsing storage config")?;
            let storage = Storage::open(&config).context("opening storage")?;
            inspect(&storage, &args[3..])
        }
        other => {
            bail!("unknown command '{}' (try --help)", other);
        }
    }
}

fn inspect(storage: &Storage, args: &[String]) -> Result<()> {
    let what = args
        .first()
        .ok_or_else(|| anyhow!("missing inspect subcommand"))?;
    match what.as_str() {
        "nofdocs" => {
            println!("{}", storage.nof_documents());
        }
        "maxdocno" => {
            println!("{}", storage.max_docno());
        }
        "df" => {
            let (ttype, value) = two_args(args, "df <type> <value>")?;
            println!("{}", storage.document_frequency(ttype, value)?);
        }
        "pos" => {
            let (ttype, value, docid) = three_args(args, "pos <type> <value> <docid>")?;
            let docno = resolve_docno(storage, docid)?;
            let mut itr = storage.posting_iterator(ttype, value)?;
            if itr.skip_doc(docno)? == docno {
                let positions = itr.positions()?;
                let strs: Vec<String> = positions.iter().map(|p| p.to_string()).collect();
                println!("{}", strs.join(" "));
            }
        }
        "ff" => {
            let (ttype, value, docid) = three_args(args, "ff <type> <value> <docid>")?;
            let docno = resolve_docno(storage, docid)?;
            let mut itr = storage.posting_iterator(ttype, value)?;
            if itr.skip_doc(docno)? == docno {
                println!("{}", itr.frequency()?);
            } else {
                println!("0");
            }
        }
        "metadata" => {
            let (docid, name) = two_args(&args[..], "metadata <docid> <name>")?;
            let docno = resolve_docno(storage, docid)?;
            let mut reader = storage.metadata_reader();
            let handle = reader.element_handle(name)?;
            reader.skip_doc(docno)?;
            match reader.get_value(handle)? {
                ScalarValue::Null => println!("NULL"),
                ScalarValue::Int(v) => println!("{}", v),
                ScalarValue::UInt(v) => println!("{}", v),
                ScalarValue::Float(v) => println!("{}", v),
            }
        }
        "attribute" => {
            let (docid, name) = two_args(&args[..], "attribute <docid> <name>")?;
            let docno = resolve_docno(storage, docid)?;
            match storage.attribute(docno, name)? {
                Some(value) => println!("{}", value),
                None => println!(),
            }
        }
        "content" => {
            let (ttype, docid) = two_args(&args[..], "content <type> <docid>")?;
            let docno = resolve_docno(storage, docid)?;
            let mut itr = storage.forward_iterator(ttype)?;
            itr.skip_doc(docno);
            let mut tokens = Vec::new();
            let mut pos = itr.skip_pos(1)?;
            while pos != 0 {
                tokens.push(itr.fetch()?);
                pos = itr.skip_pos(pos + 1)?;
            }
            println!("{}", tokens.join(" "));
        }
        other => {
            bail!("unknown inspect subcommand '{}'", other);
        }
    }
    Ok(())
}

fn resolve_docno(storage: &Storage, docid: &str) -> Result<searchstore::Index> {
    let docno = storage.docno(docid)?;
    if docno == 0 {
        bail!("document '{}' not found", docid);
    }
    Ok(docno)
}

fn two_args<'a>(args: &'a [String], usage: &str) -> Result<(&'a str, &'a str)> {
    match (args.get(1), args.get(2)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => bail!("usage: searchstore-cli inspect <config> {}", usage),
    }
}

fn three_args<'a>(args: &'a [String], usage: &str) -> Result<(&'a str, &'a str, &'a str)> {
    match (args.get(1), args.get(2), args.get(3)) {
        (Some(a), Some(b), Some(c)) => Ok((a, b, c)),
        _ => bail!("usage: searchstore-cli inspect <config> {}", usage),
    }
}

fn print_help() {
    println!(
        r#"searchstore v{} - full-text search storage engine

usage:
  searchstore-cli create <config>
      create a storage; config is a 'key=value;...' string with
      path=<dir> (mandatory), metadata=<name:type,...>, cache=<size>,
      acl=<yes/no>, compression=<yes/no>

  searchstore-cli inspect <config> <what> ...
      nofdocs                      number of documents inserted
      maxdocno                     largest document number in use
      df <type> <value>            document frequency of a term
      ff <type> <value> <docid>    feature frequency in one document
      pos <type> <value> <docid>   positions of a term in one document
      metadata <docid> <name>      metadata element value
      attribute <docid> <name>     attribute value
      content <type> <docid>       forward index tokens of a document
"#,
        VERSION
    );
}
