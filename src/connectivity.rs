//! 连接状态机模块
//!
//! 管理站点模式的加入、重试和配网回退。其他模块只通过状态转换观察连接状态。

use crate::clock::{Clock, RetrySchedule};
use crate::config;
use crate::credentials::Credentials;
use crate::indicator::IndicatorStatus;
use embassy_time::{Duration, Instant};
use log::{debug, info, warn};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// 有界等待的站点加入（启动时或配网完成后）
    StationConnecting,
    /// 站点已连接，下游组件只在此状态工作
    StationConnected,
    /// 按固定间隔重试加入
    StationRetrying,
    /// 配网门户运行中
    Provisioning,
}

/// 连接事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    JoinSucceeded,
    JoinFailed,
    LinkLost,
    CredentialsSaved,
}

/// 状态转换结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    /// 保持当前状态
    Stay,
    /// 转换到新状态
    Transition(ConnectivityState),
    /// 转换到新状态并重置重试计数
    TransitionWithReset(ConnectivityState),
}

/// 无线驱动错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// 配置被驱动拒绝
    Configuration,
    /// 驱动启动或连接调用失败
    Driver,
}

impl core::fmt::Display for RadioError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RadioError::Configuration => write!(f, "radio configuration rejected"),
            RadioError::Driver => write!(f, "radio driver call failed"),
        }
    }
}

/// 站点模式无线接口
pub trait StationRadio {
    /// 开始加入网络，不等待结果
    fn begin_join(&mut self, credentials: &Credentials) -> Result<(), RadioError>;

    /// 链路是否已建立
    fn is_linked(&mut self) -> bool;

    /// 放弃当前连接或加入尝试
    fn leave(&mut self);

    /// 信号强度 (dBm)
    fn rssi(&mut self) -> Option<i8>;
}

/// 接入点模式无线接口
pub trait AccessPointRadio {
    fn start_access_point(&mut self, name: &str, address: [u8; 4]) -> Result<(), RadioError>;

    fn stop_access_point(&mut self);
}

/// 重试策略参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityPolicy {
    /// 每次加入的轮询次数
    pub join_polls: u32,
    /// 轮询间隔
    pub join_poll_interval: Duration,
    /// 稳态重试间隔
    pub retry_interval: Duration,
    /// 连续失败多少次后进入配网
    pub escalation_threshold: u32,
}

impl Default for ConnectivityPolicy {
    fn default() -> Self {
        Self {
            join_polls: config::WIFI_JOIN_POLLS,
            join_poll_interval: Duration::from_millis(config::WIFI_JOIN_POLL_INTERVAL_MS),
            retry_interval: Duration::from_millis(config::WIFI_RETRY_INTERVAL_MS),
            escalation_threshold: config::WIFI_RETRY_ESCALATION,
        }
    }
}

/// 连接管理器
pub struct ConnectivityManager {
    current_state: ConnectivityState,
    previous_state: Option<ConnectivityState>,
    credentials: Option<Credentials>,
    retry_count: u32,
    retry: RetrySchedule,
    /// 链路是否曾经建立过，决定是否记录"断开"
    link_established: bool,
    policy: ConnectivityPolicy,
}

impl ConnectivityManager {
    /// 创建连接管理器，启动时总是从 StationConnecting 开始
    pub fn new(credentials: Option<Credentials>, policy: ConnectivityPolicy) -> Self {
        Self {
            current_state: ConnectivityState::StationConnecting,
            previous_state: None,
            credentials,
            retry_count: 0,
            retry: RetrySchedule::new(policy.retry_interval),
            link_established: false,
            policy,
        }
    }

    /// 获取当前状态
    pub fn state(&self) -> ConnectivityState {
        self.current_state
    }

    /// 获取上一个状态
    pub fn previous_state(&self) -> Option<ConnectivityState> {
        self.previous_state
    }

    /// 获取重试次数
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state == ConnectivityState::StationConnected
    }

    pub fn link_established(&self) -> bool {
        self.link_established
    }

    /// 获取对应的指示灯状态
    pub fn indicator_status(&self, broker_connected: bool) -> IndicatorStatus {
        match self.current_state {
            ConnectivityState::StationConnecting => IndicatorStatus::Connecting,
            ConnectivityState::StationRetrying => IndicatorStatus::Retrying,
            ConnectivityState::Provisioning => IndicatorStatus::Provisioning,
            ConnectivityState::StationConnected if broker_connected => IndicatorStatus::Online,
            ConnectivityState::StationConnected => IndicatorStatus::BrokerDown,
        }
    }

    /// 每个循环周期调用一次；状态改变时返回新状态
    pub async fn tick<R, C>(&mut self, radio: &mut R, clock: &C) -> Option<ConnectivityState>
    where
        R: StationRadio,
        C: Clock,
    {
        let before = self.current_state;

        match self.current_state {
            ConnectivityState::StationConnecting => {
                let event = self.join(radio, clock).await;
                self.handle_event(event, clock.now());
            }

            ConnectivityState::StationConnected => {
                if !radio.is_linked() {
                    self.handle_event(ConnectivityEvent::LinkLost, clock.now());
                }
            }

            ConnectivityState::StationRetrying => {
                let now = clock.now();
                if self.retry.is_due(now) {
                    self.retry.record_attempt(now);
                    let event = self.join(radio, clock).await;
                    self.handle_event(event, clock.now());
                }
            }

            // 配网门户负责推进，见 complete_provisioning
            ConnectivityState::Provisioning => {}
        }

        (self.current_state != before).then_some(self.current_state)
    }

    /// 配网门户拿到新凭据后调用
    pub fn complete_provisioning(
        &mut self,
        credentials: Credentials,
        now: Instant,
    ) -> StateTransition {
        info!(
            "[STATE] Provisioned network {}, rejoining",
            credentials.network_name()
        );
        self.credentials = Some(credentials);
        self.handle_event(ConnectivityEvent::CredentialsSaved, now)
    }

    /// 处理连接事件
    pub fn handle_event(&mut self, event: ConnectivityEvent, now: Instant) -> StateTransition {
        if self.current_state == ConnectivityState::StationRetrying
            && event == ConnectivityEvent::JoinFailed
        {
            self.retry_count += 1;
            if self.link_established {
                warn!(
                    "[WIFI] Retry {}/{} failed",
                    self.retry_count, self.policy.escalation_threshold
                );
            } else {
                debug!(
                    "[WIFI] Retry {}/{} failed",
                    self.retry_count, self.policy.escalation_threshold
                );
            }
        }

        let transition = self.get_state_transition(self.current_state, event);

        match transition {
            StateTransition::Transition(new_state) => {
                self.transition_to_state(new_state, event, now);
            }
            StateTransition::TransitionWithReset(new_state) => {
                self.retry_count = 0;
                self.transition_to_state(new_state, event, now);
            }
            StateTransition::Stay => {}
        }

        transition
    }

    async fn join<R, C>(&mut self, radio: &mut R, clock: &C) -> ConnectivityEvent
    where
        R: StationRadio,
        C: Clock,
    {
        let Some(credentials) = self.credentials.as_ref() else {
            warn!("[WIFI] No credentials to join with");
            return ConnectivityEvent::JoinFailed;
        };

        info!(
            "[WIFI] Connecting to WiFi network: {}",
            credentials.network_name()
        );
        if let Err(e) = radio.begin_join(credentials) {
            warn!("[WIFI] Join request failed: {}", e);
            radio.leave();
            return ConnectivityEvent::JoinFailed;
        }

        for _ in 0..self.policy.join_polls {
            if radio.is_linked() {
                return ConnectivityEvent::JoinSucceeded;
            }
            clock.sleep(self.policy.join_poll_interval).await;
        }

        if radio.is_linked() {
            return ConnectivityEvent::JoinSucceeded;
        }

        info!(
            "[WIFI] Failed to connect to WiFi network after {} attempts",
            self.policy.join_polls
        );
        radio.leave();
        ConnectivityEvent::JoinFailed
    }

    /// 内部状态转换逻辑
    fn transition_to_state(
        &mut self,
        new_state: ConnectivityState,
        event: ConnectivityEvent,
        now: Instant,
    ) {
        if new_state == self.current_state {
            return;
        }

        match new_state {
            ConnectivityState::StationConnected => {
                self.link_established = true;
                self.retry.reset();
                info!("[STATE] Station connected");
            }
            ConnectivityState::StationRetrying => {
                if event == ConnectivityEvent::LinkLost {
                    // 链路丢失后立即重试
                    self.retry.reset();
                    if self.link_established {
                        warn!("[WIFI] WiFi connection lost!");
                    }
                } else {
                    self.retry.reset();
                    self.retry.defer(now);
                }
                info!(
                    "[STATE] Retrying every {}s",
                    self.policy.retry_interval.as_secs()
                );
            }
            ConnectivityState::Provisioning => {
                self.retry.reset();
                warn!("[STATE] Entering provisioning mode");
            }
            ConnectivityState::StationConnecting => {}
        }

        self.previous_state = Some(self.current_state);
        self.current_state = new_state;
    }

    /// 获取状态转换规则
    fn get_state_transition(
        &self,
        current_state: ConnectivityState,
        event: ConnectivityEvent,
    ) -> StateTransition {
        match (current_state, event) {
            (ConnectivityState::StationConnecting, ConnectivityEvent::JoinSucceeded) => {
                StateTransition::TransitionWithReset(ConnectivityState::StationConnected)
            }
            (ConnectivityState::StationConnecting, ConnectivityEvent::JoinFailed) => {
                if self.credentials.is_some() {
                    StateTransition::Transition(ConnectivityState::StationRetrying)
                } else {
                    // 没有凭据时不进入重试循环
                    StateTransition::TransitionWithReset(ConnectivityState::Provisioning)
                }
            }

            (ConnectivityState::StationConnected, ConnectivityEvent::LinkLost) => {
                StateTransition::Transition(ConnectivityState::StationRetrying)
            }

            (ConnectivityState::StationRetrying, ConnectivityEvent::JoinSucceeded) => {
                StateTransition::TransitionWithReset(ConnectivityState::StationConnected)
            }
            (ConnectivityState::StationRetrying, ConnectivityEvent::JoinFailed) => {
                if self.retry_count >= self.policy.escalation_threshold
                    && self.credentials.is_some()
                {
                    // 凭据可能已过期，交给人工配网
                    StateTransition::TransitionWithReset(ConnectivityState::Provisioning)
                } else {
                    StateTransition::Stay
                }
            }

            (ConnectivityState::Provisioning, ConnectivityEvent::CredentialsSaved) => {
                StateTransition::Transition(ConnectivityState::StationConnecting)
            }

            // 默认情况：保持当前状态
            _ => StateTransition::Stay,
        }
    }
}
