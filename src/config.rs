use std::sync::LazyLock;

pub struct AppConfig {
    bind_addr: String,
    ffmpeg_bin: String,
    work_dir: String,
    video_format: String,
    video_input: String,
    audio_format: String,
    audio_input: String,
    frame_rate: u32,
    video_width: u32,
    video_height: u32,
    audio_sample_rate: u32,
    audio_channels: u32,
}

impl AppConfig {
    fn from_env() -> Self {
        Self {
            bind_addr: env_or("STREAMPUSH_BIND", "0.0.0.0:8080"),
            ffmpeg_bin: env_or("STREAMPUSH_FFMPEG", "ffmpeg"),
            work_dir: env_or("STREAMPUSH_WORK_DIR", "/tmp/streampush"),
            video_format: env_or("STREAMPUSH_VIDEO_FORMAT", "v4l2"),
            video_input: env_or("STREAMPUSH_VIDEO_INPUT", "/dev/video0"),
            audio_format: env_or("STREAMPUSH_AUDIO_FORMAT", "pulse"),
            audio_input: env_or("STREAMPUSH_AUDIO_INPUT", "default"),
            frame_rate: env_num("STREAMPUSH_FRAME_RATE", 30),
            video_width: env_num("STREAMPUSH_VIDEO_WIDTH", 1280),
            video_height: env_num("STREAMPUSH_VIDEO_HEIGHT", 720),
            audio_sample_rate: env_num("STREAMPUSH_AUDIO_SAMPLE_RATE", 48000),
            audio_channels: env_num("STREAMPUSH_AUDIO_CHANNELS", 2),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn ffmpeg_bin(&self) -> &str {
        &self.ffmpeg_bin
    }

    pub fn work_dir(&self) -> &str {
        &self.work_dir
    }

    pub fn video_format(&self) -> &str {
        &self.video_format
    }

    pub fn video_input(&self) -> &str {
        &self.video_input
    }

    pub fn audio_format(&self) -> &str {
        &self.audio_format
    }

    pub fn audio_input(&self) -> &str {
        &self.audio_input
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn video_width(&self) -> u32 {
        self.video_width
    }

    pub fn video_height(&self) -> u32 {
        self.video_height
    }

    pub fn audio_sample_rate(&self) -> u32 {
        self.audio_sample_rate
    }

    pub fn audio_channels(&self) -> u32 {
        self.audio_channels
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_num(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn config() -> &'static AppConfig {
    static CONFIG: LazyLock<AppConfig> = LazyLock::new(AppConfig::from_env);
    &CONFIG
}
