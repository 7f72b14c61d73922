use std::path::PathBuf;

use anyhow::Context;
use lanthing_proto::messages::codecs_from_csv;

use crate::worker::WorkerArgs;

const DEFAULT_CONFIG_PATH: &str = "/etc/lanthing/lanthing.toml";

pub enum LaunchMode {
    /// Host service (the default).
    Service { config_path: PathBuf },
    /// Per-connection worker child, launched by the service with our own
    /// image.
    Worker(WorkerArgs),
}

pub fn parse_args() -> anyhow::Result<LaunchMode> {
    parse(std::env::args().skip(1).collect())
}

fn parse(args: Vec<String>) -> anyhow::Result<LaunchMode> {
    let mut launch_type = "service".to_string();
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut pipe_name = String::new();
    let mut width: u32 = 1920;
    let mut height: u32 = 1080;
    let mut refresh_rate: u32 = 60;
    let mut codecs = vec![lanthing_proto::messages::VideoCodecType::H264_420];
    let mut action = "streaming".to_string();
    let mut monitor_index: u32 = 0;
    let mut negotiate = true;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("lanthing {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("lanthing - remote desktop host service");
                println!();
                println!("USAGE:");
                println!("    lanthing [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -type <service|worker>       Launch mode [default: service]");
                println!("    --config <PATH>, -c <PATH>   Service config file");
                println!("    -name <PIPE>                 Worker: session pipe name (required)");
                println!("    -width <PIXELS>              Worker: client width [default: 1920]");
                println!("    -height <PIXELS>             Worker: client height [default: 1080]");
                println!("    -freq <HZ>                   Worker: refresh rate [default: 60]");
                println!("    -codecs <CSV>                Worker: codec preference, e.g. hevc,avc");
                println!("    -action <NAME>               Worker: only 'streaming' is supported");
                println!("    -mindex <N>                  Worker: monitor index [default: 0]");
                println!("    -negotiate <0|1>             Worker: re-run parameter negotiation");
                println!("    -V, --version                Print version and exit");
                println!("    -h, --help                   Print this help and exit");
                std::process::exit(0);
            }
            "-type" => {
                i += 1;
                launch_type = args.get(i).context("Missing -type value")?.clone();
            }
            "--config" | "-c" => {
                i += 1;
                config_path = PathBuf::from(args.get(i).context("Missing --config value")?);
            }
            "-name" => {
                i += 1;
                pipe_name = args.get(i).context("Missing -name value")?.clone();
            }
            "-width" => {
                i += 1;
                width = args
                    .get(i)
                    .context("Missing -width value")?
                    .parse()
                    .context("Invalid -width value")?;
            }
            "-height" => {
                i += 1;
                height = args
                    .get(i)
                    .context("Missing -height value")?
                    .parse()
                    .context("Invalid -height value")?;
            }
            "-freq" => {
                i += 1;
                refresh_rate = args
                    .get(i)
                    .context("Missing -freq value")?
                    .parse()
                    .context("Invalid -freq value")?;
            }
            "-codecs" => {
                i += 1;
                let csv = args.get(i).context("Missing -codecs value")?;
                codecs = codecs_from_csv(csv);
                if codecs.is_empty() {
                    anyhow::bail!("No known codec in -codecs {csv}");
                }
            }
            "-action" => {
                i += 1;
                action = args.get(i).context("Missing -action value")?.clone();
            }
            "-mindex" => {
                i += 1;
                monitor_index = args
                    .get(i)
                    .context("Missing -mindex value")?
                    .parse()
                    .context("Invalid -mindex value")?;
            }
            "-negotiate" => {
                i += 1;
                negotiate = match args.get(i).context("Missing -negotiate value")?.as_str() {
                    "0" => false,
                    "1" => true,
                    other => anyhow::bail!("Invalid -negotiate value {other}"),
                };
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    match launch_type.as_str() {
        "service" => Ok(LaunchMode::Service { config_path }),
        "worker" => {
            if pipe_name.is_empty() {
                anyhow::bail!("-name is required for -type worker");
            }
            if action != "streaming" {
                anyhow::bail!("Unsupported -action {action}");
            }
            Ok(LaunchMode::Worker(WorkerArgs {
                pipe_name,
                width,
                height,
                refresh_rate,
                codecs,
                monitor_index,
                negotiate,
            }))
        }
        other => anyhow::bail!("Unknown -type {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanthing_proto::messages::VideoCodecType;

    fn split(line: &str) -> Vec<String> {
        line.split_whitespace().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_is_service_mode() {
        match parse(vec![]).unwrap() {
            LaunchMode::Service { config_path } => {
                assert_eq!(config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
            }
            _ => panic!("expected service mode"),
        }
    }

    #[test]
    fn service_config_override() {
        match parse(split("-type service --config /tmp/l.toml")).unwrap() {
            LaunchMode::Service { config_path } => {
                assert_eq!(config_path, PathBuf::from("/tmp/l.toml"));
            }
            _ => panic!("expected service mode"),
        }
    }

    #[test]
    fn worker_line_roundtrips_from_the_supervisor() {
        let line = "-type worker -name Lanthing_worker_ABCD -width 2560 -height 1440 \
                    -freq 144 -codecs hevc,avc -action streaming -mindex 1 -negotiate 1";
        match parse(split(line)).unwrap() {
            LaunchMode::Worker(args) => {
                assert_eq!(args.pipe_name, "Lanthing_worker_ABCD");
                assert_eq!(args.width, 2560);
                assert_eq!(args.height, 1440);
                assert_eq!(args.refresh_rate, 144);
                assert_eq!(
                    args.codecs,
                    vec![VideoCodecType::H265_420, VideoCodecType::H264_420]
                );
                assert_eq!(args.monitor_index, 1);
                assert!(args.negotiate);
            }
            _ => panic!("expected worker mode"),
        }
    }

    #[test]
    fn worker_negotiate_zero() {
        let line = "-type worker -name X -negotiate 0";
        match parse(split(line)).unwrap() {
            LaunchMode::Worker(args) => assert!(!args.negotiate),
            _ => panic!("expected worker mode"),
        }
    }

    #[test]
    fn worker_requires_pipe_name() {
        assert!(parse(split("-type worker")).is_err());
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(parse(split("-type worker -name X -action capture")).is_err());
    }

    #[test]
    fn unknown_argument_is_rejected() {
        assert!(parse(split("--bogus")).is_err());
    }

    #[test]
    fn unknown_codec_only_is_rejected() {
        assert!(parse(split("-type worker -name X -codecs vp9")).is_err());
    }
}
