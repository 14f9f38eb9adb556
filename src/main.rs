use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tagdex::database::curation::TagDiff;
use tagdex::ingest::tagger::{scan_and_store, Tagger};
use tagdex::models::{Rating, SearchFilters, SearchRequest, TagType};
use tagdex::{Config, OnnxTagger, TagIndex, TempUpload, Vocabulary};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; defaults apply when it does not exist.
    #[arg(short, long, default_value = "tagdex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema and load the tag vocabulary.
    Init,
    /// Register images under the root without tagging them.
    Scan,
    /// Scan, then tag every untagged image.
    Tag,
    /// List tags in use, or search tag names.
    Tags {
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long, value_parser = parse_tag_type)]
        tag_type: Option<TagType>,
    },
    /// Images carrying all of the given tags.
    Search {
        #[arg(short, long = "tag", required = true)]
        tags: Vec<i64>,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        per_page: u32,
    },
    /// Tag an image file and search with the result.
    SearchFile {
        image: PathBuf,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        per_page: u32,
    },
    /// Tags shared by every given image.
    Common {
        #[arg(short, long = "image", required = true)]
        images: Vec<i64>,
        #[arg(long, value_parser = parse_tag_type, default_value = "general")]
        tag_type: TagType,
        #[arg(long, default_value_t = 0.5)]
        min_prob: f32,
    },
    /// Make the given tags the common tags of the selection.
    Apply {
        #[arg(short, long = "image", required = true)]
        images: Vec<i64>,
        #[arg(short, long = "tag")]
        tags: Vec<i64>,
        /// New tag text; created when unknown.
        #[arg(long = "text")]
        texts: Vec<String>,
        #[arg(long, value_parser = parse_tag_type, default_value = "general")]
        tag_type: TagType,
        #[arg(long, default_value_t = 0.5)]
        min_prob: f32,
    },
    /// Most frequent tags among images with a high rating score.
    Top {
        #[arg(long, value_parser = parse_rating, default_value = "general")]
        rating: Rating,
        #[arg(long, value_parser = parse_tag_type, default_value = "general")]
        tag_type: TagType,
    },
    /// List images sharing content, optionally collapsing safe pairs.
    Dupes {
        #[arg(long)]
        auto: bool,
    },
    /// Drop rows whose file is gone.
    Cleanup,
    /// Recompute tag usage counts.
    Recount,
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct FilterArgs {
    #[arg(long, default_value_t = 0.0)]
    f_tag: f32,
    #[arg(long, default_value_t = 0.0)]
    f_general: f32,
    #[arg(long, default_value_t = 0.0)]
    f_sensitive: f32,
    #[arg(long, default_value_t = 0.0)]
    f_questionable: f32,
    #[arg(long, default_value_t = 0.0)]
    f_explicit: f32,
}

impl From<FilterArgs> for SearchFilters {
    fn from(args: FilterArgs) -> Self {
        SearchFilters {
            f_tag: args.f_tag,
            f_general: args.f_general,
            f_sensitive: args.f_sensitive,
            f_explicit: args.f_explicit,
            f_questionable: args.f_questionable,
        }
    }
}

fn parse_tag_type(s: &str) -> std::result::Result<TagType, String> {
    TagType::from_name(s).ok_or_else(|| format!("unknown tag type '{s}'"))
}

fn parse_rating(s: &str) -> std::result::Result<Rating, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "general" => Ok(Rating::General),
        "sensitive" => Ok(Rating::Sensitive),
        "questionable" => Ok(Rating::Questionable),
        "explicit" => Ok(Rating::Explicit),
        _ => Err(format!("unknown rating '{s}'")),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        return Config::load(path);
    }
    warn!("Config {:?} not found, using defaults", path);
    let config = Config::default();
    config.validate()?;
    Ok(config)
}

fn load_classifier(config: &Config, config_path: &Path) -> Result<OnnxTagger> {
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let model = config.resolve_model_path(base)?;
    let vocabulary = Vocabulary::load(&config.vocabulary_path)?;
    Ok(OnnxTagger::load(&model, vocabulary, config.floors())?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    let config = load_config(&args.config)?;
    info!("DB: {:?}", config.db_path);

    let index = TagIndex::new(&config)?;
    match args.command {
        Command::Init => {
            let vocabulary = Vocabulary::load(&config.vocabulary_path)?;
            let tags = index.init(&vocabulary)?;
            print_json(&serde_json::json!({ "tags": tags }))?;
        }
        Command::Scan => {
            let mut store = config.store().open()?;
            print_json(&scan_and_store(&config, &mut store)?)?;
        }
        Command::Tag => {
            let classifier = load_classifier(&config, &args.config)?;
            let mut store = config.store().open()?;
            let tagger = Tagger::new(config.clone(), Arc::new(classifier));
            print_json(&tagger.run(&mut store)?)?;
        }
        Command::Tags { query, tag_type } => match query {
            Some(q) => print_json(&index.search_tags(&q, tag_type)?)?,
            None => print_json(&index.list_tags()?)?,
        },
        Command::Search {
            tags,
            filters,
            page,
            per_page,
        } => {
            let request = SearchRequest::new(tags, page, per_page).with_filters(filters.into());
            print_json(&index.search_images(&request)?)?;
        }
        Command::SearchFile {
            image,
            filters,
            page,
            per_page,
        } => {
            let classifier = load_classifier(&config, &args.config)?;
            let index = index.with_classifier(Arc::new(classifier));
            let name = image
                .file_name()
                .with_context(|| format!("not a file: {:?}", image))?;
            let copy = std::env::temp_dir().join(format!(
                "tagdex-{}-{}",
                std::process::id(),
                name.to_string_lossy()
            ));
            fs::copy(&image, &copy).with_context(|| format!("Failed to read {:?}", image))?;
            let outcome =
                index.search_by_upload(TempUpload::adopt(copy), filters.into(), page, per_page)?;
            print_json(&outcome)?;
        }
        Command::Common {
            images,
            tag_type,
            min_prob,
        } => print_json(&index.common_tags(&images, tag_type, min_prob)?)?,
        Command::Apply {
            images,
            tags,
            texts,
            tag_type,
            min_prob,
        } => {
            let diff = TagDiff {
                image_ids: images,
                desired_tag_ids: tags,
                new_tag_texts: texts,
                tag_type,
                min_probability: min_prob,
            };
            print_json(&index.apply_tag_diff(&diff)?)?;
        }
        Command::Top { rating, tag_type } => print_json(&index.top_tags(rating, tag_type)?)?,
        Command::Dupes { auto } => {
            if auto {
                print_json(&index.resolve_duplicates()?)?;
            } else {
                print_json(&index.find_duplicates()?)?;
            }
        }
        Command::Cleanup => print_json(&index.cleanup_missing_files()?)?,
        Command::Recount => {
            let tags = index.recompute_usage_counts()?;
            print_json(&serde_json::json!({ "tags": tags }))?;
        }
    }
    Ok(())
}
