//! FFmpeg-backed capture: spawns `ffmpeg` and reads raw `rgb24` frames from
//! its stdout.

use std::{
    io::Read,
    process::{Child, ChildStdout, Command, Stdio},
};

use anyhow::anyhow;
use chrono::Utc;
use tracing::debug;

use crate::{
    device::{CameraDevice, CameraSource, parse_device_index},
    types::{CaptureError, CaptureParameters, Frame, FrameFormat},
};

pub struct FfmpegSource {
    uri: String,
}

impl FfmpegSource {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
        }
    }
}

impl CameraSource for FfmpegSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create(&self) -> Result<Box<dyn CameraDevice>, CaptureError> {
        Ok(Box::new(FfmpegCamera {
            uri: self.uri.clone(),
            child: None,
            stdout: None,
            size: (0, 0),
        }))
    }
}

struct FfmpegCamera {
    uri: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    size: (u32, u32),
}

impl FfmpegCamera {
    fn command(&self, params: &CaptureParameters) -> Command {
        let (is_v4l, ffmpeg_uri) = if let Some(index) = parse_device_index(&self.uri) {
            (true, format!("/dev/video{index}"))
        } else {
            (self.uri.starts_with("/dev/"), self.uri.clone())
        };

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        if is_v4l {
            cmd.arg("-f")
                .arg("video4linux2")
                .arg("-framerate")
                .arg(params.fps.to_string())
                .arg("-video_size")
                .arg(format!("{}x{}", params.width, params.height));
        }

        cmd.arg("-i")
            .arg(&ffmpeg_uri)
            .arg("-vf")
            .arg(format!("scale={}:{}", params.width, params.height))
            .arg("-r")
            .arg(params.fps.to_string())
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl CameraDevice for FfmpegCamera {
    fn start(&mut self, params: &CaptureParameters) -> Result<(), CaptureError> {
        let mut child = self.command(params).spawn()?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Other(anyhow!(
                    "failed to capture ffmpeg stdout"
                )));
            }
        };
        debug!(uri = %self.uri, pid = child.id(), "ffmpeg capture started");
        self.child = Some(child);
        self.stdout = Some(stdout);
        self.size = (params.width, params.height);
        Ok(())
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        let stdout = self.stdout.as_mut().ok_or(CaptureError::Closed)?;
        let (width, height) = self.size;
        let mut data = vec![0u8; width as usize * height as usize * 3];
        stdout
            .read_exact(&mut data)
            .map_err(|err| CaptureError::Read(format!("ffmpeg stream ended: {err}")))?;
        Ok(Frame {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Rgb8,
        })
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.stdout = None;
        if let Some(child) = self.child.as_mut() {
            child.kill()?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), CaptureError> {
        if let Some(mut child) = self.child.take() {
            child.wait()?;
        }
        Ok(())
    }
}
