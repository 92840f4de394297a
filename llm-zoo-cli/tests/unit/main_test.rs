use super::*;

#[test]
fn test_parse_tokens() -> Result<()> {
    assert_eq!(parse_tokens("50256")?, vec![50256]);
    assert_eq!(parse_tokens(" 1, 2 ,3,")?, vec![1, 2, 3]);
    assert!(parse_tokens("")?.is_empty());

    Ok(())
}

#[test]
fn test_parse_tokens_rejects_garbage() {
    let err = parse_tokens("1,two,3").expect_err("non-numeric ids must fail");
    assert!(err.to_string().contains("two"), "{err}");
}

#[test]
fn test_generate_arguments() -> Result<()> {
    let matches = generate_subcommand().try_get_matches_from([
        "generate", "/models/gpt2", "--input", "1,2", "-n", "3", "-k", "1", "--seed", "9", "-c", "64",
    ])?;

    let config = generate_config(&matches)?;

    assert_eq!(config.model_path, PathBuf::from("/models/gpt2"));
    assert_eq!(config.config_path, PathBuf::from("/models/gpt2"));
    assert_eq!((config.length_limit, config.top_k, config.seed), (3, 1, 9));
    assert_eq!(config.context_size, Some(64));
    assert_eq!(matches.get_one::<String>("input").map(String::as_str), Some("1,2"));

    Ok(())
}

#[test]
fn test_info_counts_by_default() -> Result<()> {
    let matches = info_subcommand().try_get_matches_from(["info", "/models/llama", "--config", "/configs/llama"])?;

    assert!(!matches.get_flag("load"));
    let config = base_config(&matches).calculation_only(Some(true)).build()?;
    assert_eq!(config.config_path, PathBuf::from("/configs/llama"));

    Ok(())
}

struct BrokenPipe;

impl Write for BrokenPipe {
    fn write(&mut self, _: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_print_event() -> Result<()> {
    let mut out = Vec::new();

    print_event(&mut out, GenerationEvent::Progress { position: 0 })?;
    print_event(&mut out, GenerationEvent::Token { token: 42, position: 1 })?;

    assert_eq!(String::from_utf8(out)?, ". 42");

    Ok(())
}

#[test]
fn test_print_event_reports_write_errors() {
    let err = print_event(&mut BrokenPipe, GenerationEvent::Token { token: 7, position: 3 })
        .expect_err("a closed output must fail");

    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
}
