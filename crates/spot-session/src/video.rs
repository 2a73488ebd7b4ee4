//! 视频与电量推送
//!
//! 独立的后台线程循环：取前置左右鱼眼图像交给拼接器，广播拼接结果
//! （拼接器不可用时广播两张原始图像），再广播后置图像与电量信息。
//! 线程与主循环完全解耦，`stop()` 后在下一帧边界退出。
//!
//! 持续失败（相机或网络异常）只在失败类型变化时通知客户端，之后降为调试日志。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use spot_protocol::{CameraFeed, NotificationKind};
use spot_robot::{ImageResponse, ImageService, RobotConnection, SdkError, SdkErrorKind};
use tracing::{debug, error, info};

use crate::JoinTimeout;
use crate::config::VideoConfig;
use crate::error::{SessionError, report};
use crate::notify::{NotificationBus, Target};

/// 前置双目图像拼接器
pub trait Stitcher: Send + Sync {
    /// 拼接右/左前置图像，返回 JPEG；无法拼接时返回 `None`
    ///
    /// 相机坐标树校验失败时返回 [`SdkErrorKind::FrameTreeInvalid`]。
    fn stitch(&self, right: &ImageResponse, left: &ImageResponse)
    -> Result<Option<Vec<u8>>, SdkError>;
}

/// 不做拼接，始终回退到原始图像
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStitcher;

impl Stitcher for NoStitcher {
    fn stitch(
        &self,
        _right: &ImageResponse,
        _left: &ImageResponse,
    ) -> Result<Option<Vec<u8>>, SdkError> {
        Ok(None)
    }
}

/// 视频推送线程句柄
pub struct VideoStreamer {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct FrameSource {
    images: Arc<dyn ImageService>,
    robot: Arc<dyn RobotConnection>,
    stitcher: Arc<dyn Stitcher>,
    bus: Arc<NotificationBus>,
    config: VideoConfig,
}

impl VideoStreamer {
    pub fn start(
        robot: Arc<dyn RobotConnection>,
        images: Arc<dyn ImageService>,
        stitcher: Arc<dyn Stitcher>,
        bus: Arc<NotificationBus>,
        config: VideoConfig,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let source = FrameSource {
            images,
            robot,
            stitcher,
            bus,
            config,
        };
        let running_clone = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("spot-video".to_string())
            .spawn(move || source.run(&running_clone))?;
        info!("Video streaming started");
        Ok(Self {
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 停止推送并等待线程退出
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let join_timeout = Duration::from_secs(2);
        if let Some(handle) = self.handle.lock().take()
            && let Err(_e) = handle.join_timeout(join_timeout)
        {
            error!(
                "Video thread panicked or failed to shut down within {:?}",
                join_timeout
            );
        }
    }
}

impl Drop for VideoStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 连续失败的去重状态
#[derive(Debug, Default)]
struct FailureLatch {
    kind: Option<SdkErrorKind>,
}

impl FailureLatch {
    fn fail(&mut self, bus: &NotificationBus, error: SdkError) {
        if self.kind == Some(error.kind) {
            debug!("Video still failing: {}", error);
            return;
        }
        self.kind = Some(error.kind);
        report(bus, Target::Broadcast, &SessionError::Sdk(error));
    }

    fn clear(&mut self) {
        if self.kind.take().is_some() {
            info!("Video stream recovered");
        }
    }
}

impl FrameSource {
    fn run(&self, running: &AtomicBool) {
        let mut latch = FailureLatch::default();
        while running.load(Ordering::Acquire) {
            self.frame(&mut latch);
            self.stream_robot_state();
            thread::sleep(self.config.frame_interval());
        }
        debug!("Video thread exited");
    }

    fn frame(&self, latch: &mut FailureLatch) {
        match self.stream_images() {
            Ok(None) => latch.clear(),
            Ok(Some(e)) | Err(e) => latch.fail(&self.bus, e),
        }
    }

    fn fetch(&self, source: &str) -> Result<ImageResponse, SdkError> {
        self.images
            .get_image_from_sources(&[source])?
            .into_iter()
            .next()
            .ok_or_else(|| {
                SdkError::new(SdkErrorKind::Other, format!("no image returned from {}", source))
            })
    }

    fn publish(&self, feed: CameraFeed, data: &[u8]) {
        self.bus.event(
            Target::Broadcast,
            NotificationKind::Image(feed),
            STANDARD.encode(data),
        );
    }

    /// 推送一帧图像
    ///
    /// 拼接器报告坐标树错误时仍推送原始图像，错误通过 `Ok(Some(..))` 交给调用方。
    fn stream_images(&self) -> Result<Option<SdkError>, SdkError> {
        let right = self.fetch(&self.config.front_right_source)?;
        let left = self.fetch(&self.config.front_left_source)?;

        let degraded = match self.stitcher.stitch(&right, &left) {
            Ok(Some(jpeg)) => {
                self.publish(CameraFeed::Front, &jpeg);
                None
            },
            Ok(None) => {
                self.publish(CameraFeed::FrontRight, &right.data);
                self.publish(CameraFeed::FrontLeft, &left.data);
                None
            },
            Err(e) if e.is(SdkErrorKind::FrameTreeInvalid) => {
                self.publish(CameraFeed::FrontRight, &right.data);
                self.publish(CameraFeed::FrontLeft, &left.data);
                Some(e)
            },
            Err(e) => return Err(e),
        };

        let back = self.fetch(&self.config.back_source)?;
        self.publish(CameraFeed::Back, &back.data);
        Ok(degraded)
    }

    fn stream_robot_state(&self) {
        match self.robot.robot_state() {
            Ok(state) => {
                self.bus.event(
                    Target::Broadcast,
                    NotificationKind::BatteryPercentage,
                    state.battery_percentage,
                );
                self.bus.event(
                    Target::Broadcast,
                    NotificationKind::BatteryRuntime,
                    state.estimated_runtime.as_secs(),
                );
            },
            Err(e) => debug!("Failed to read robot state: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spot_protocol::{Notification, Severity};
    use spot_robot::mock::MockRobot;
    use spot_robot::{Credentials, RobotSdk};

    struct FailingStitcher(SdkErrorKind);

    impl Stitcher for FailingStitcher {
        fn stitch(
            &self,
            _right: &ImageResponse,
            _left: &ImageResponse,
        ) -> Result<Option<Vec<u8>>, SdkError> {
            Err(SdkError::new(self.0, "frame tree"))
        }
    }

    struct ConcatStitcher;

    impl Stitcher for ConcatStitcher {
        fn stitch(
            &self,
            right: &ImageResponse,
            left: &ImageResponse,
        ) -> Result<Option<Vec<u8>>, SdkError> {
            Ok(Some([right.data.as_slice(), left.data.as_slice()].concat()))
        }
    }

    fn source(stitcher: Arc<dyn Stitcher>) -> (FrameSource, crossbeam_channel::Receiver<Notification>) {
        source_with(&MockRobot::new(), stitcher)
    }

    fn source_with(
        robot: &MockRobot,
        stitcher: Arc<dyn Stitcher>,
    ) -> (FrameSource, crossbeam_channel::Receiver<Notification>) {
        let conn = robot.connect("mock", &Credentials::default()).unwrap();
        let bus = Arc::new(NotificationBus::default());
        let (_id, rx) = bus.subscribe();
        let _ = rx.try_recv();
        let source = FrameSource {
            images: conn.image_service().unwrap(),
            robot: conn,
            stitcher,
            bus,
            config: VideoConfig::default(),
        };
        (source, rx)
    }

    fn kinds(rx: &crossbeam_channel::Receiver<Notification>) -> Vec<&'static str> {
        rx.try_iter().map(|n| n.kind.as_str()).collect()
    }

    #[test]
    fn test_raw_frames_without_stitcher() {
        let (source, rx) = source(Arc::new(NoStitcher));
        assert!(source.stream_images().unwrap().is_none());
        assert_eq!(kinds(&rx), vec!["@front_right", "@front_left", "@back"]);
    }

    #[test]
    fn test_stitched_front() {
        let (source, rx) = source(Arc::new(ConcatStitcher));
        source.stream_images().unwrap();
        let front = rx.try_recv().unwrap();
        assert_eq!(front.kind, NotificationKind::Image(CameraFeed::Front));
        let decoded = STANDARD.decode(front.text().unwrap()).unwrap();
        assert_eq!(decoded.len(), 8);
    }

    #[test]
    fn test_frame_tree_failure_reports_and_falls_back() {
        let (source, rx) = source(Arc::new(FailingStitcher(SdkErrorKind::FrameTreeInvalid)));
        let mut latch = FailureLatch::default();
        source.frame(&mut latch);
        let notes: Vec<_> = rx.try_iter().collect();
        assert_eq!(notes[0].kind, NotificationKind::Image(CameraFeed::FrontRight));
        assert_eq!(notes[1].kind, NotificationKind::Image(CameraFeed::FrontLeft));
        assert_eq!(notes[2].kind, NotificationKind::Image(CameraFeed::Back));
        assert_eq!(notes[3].text(), Some("Issue with cameras, robot must be rebooted"));
    }

    #[test]
    fn test_repeated_failure_reported_once() {
        let robot = MockRobot::new();
        let (source, rx) = source_with(&robot, Arc::new(NoStitcher));
        let mut latch = FailureLatch::default();
        robot.fail_on("image", SdkErrorKind::Rpc);

        for _ in 0..5 {
            source.frame(&mut latch);
        }
        let errors = rx
            .try_iter()
            .filter(|n| n.severity == Some(Severity::Error))
            .count();
        assert_eq!(errors, 1);

        // 恢复后再次失败会重新通知
        robot.clear_failure("image");
        source.frame(&mut latch);
        assert_eq!(kinds(&rx), vec!["@front_right", "@front_left", "@back"]);
        robot.fail_on("image", SdkErrorKind::Rpc);
        source.frame(&mut latch);
        assert_eq!(
            rx.try_iter()
                .filter(|n| n.severity == Some(Severity::Error))
                .count(),
            1
        );
    }

    #[test]
    fn test_robot_state_broadcast() {
        let (source, rx) = source(Arc::new(NoStitcher));
        source.stream_robot_state();
        let notes: Vec<_> = rx.try_iter().collect();
        assert_eq!(notes[0].kind, NotificationKind::BatteryPercentage);
        assert_eq!(notes[0].payload, serde_json::json!(87.0));
        assert_eq!(notes[1].payload, serde_json::json!(3600));
    }

    #[test]
    fn test_streamer_stops() {
        let robot = MockRobot::new();
        let conn = robot.connect("mock", &Credentials::default()).unwrap();
        let config = VideoConfig {
            frame_interval_ms: 1,
            ..VideoConfig::default()
        };
        let streamer = VideoStreamer::start(
            Arc::clone(&conn),
            conn.image_service().unwrap(),
            Arc::new(NoStitcher),
            Arc::new(NotificationBus::default()),
            config,
        )
        .unwrap();
        assert!(streamer.is_running());
        streamer.stop();
        assert!(!streamer.is_running());
    }
}
