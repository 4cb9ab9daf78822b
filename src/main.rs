#![no_std]
#![no_main]

use core::net::Ipv4Addr;
use esp_hal::analog::adc::{Adc, AdcConfig, Attenuation};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::ledc::channel::ChannelIFace;
use esp_hal::ledc::timer::TimerIFace;
use esp_hal::ledc::{LSGlobalClkSource, Ledc, LowSpeed, channel, timer};
use esp_hal::rmt::Rmt;
use esp_hal::rng::Rng;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal_smartled::{SmartLedsAdapter, smart_led_buffer};
use esp_storage::FlashStorage;
use log::{error, info};

// Standard library imports
extern crate alloc;

// WiFi imports
use esp_wifi::wifi;

// Embassy-net imports
use embassy_net::{Config, Ipv4Cidr, StackResources, StaticConfigV4};
use esp_hal_embassy::Executor;
use static_cell::StaticCell;

// Import our library modules
use node_rs::actuators::GpioActuators;
use node_rs::hw::mqtt::mqtt_task;
use node_rs::hw::portal::{dhcp_task, dns_task, http_task};
use node_rs::hw::sensors::AnalogSensors;
use node_rs::hw::system::{EmbassyClock, EspSystem, OtaUnavailable, SntpClient, halt};
use node_rs::hw::wifi::EspRadio;
use node_rs::hw::EspPlatform;
use node_rs::node::{Node, NodeSettings, Parts};
use node_rs::portal::{ChannelPortalLink, PortalChannels};
use node_rs::session::{ChannelMqttLink, MqttChannels};
use node_rs::{NodeError, config};

// Add app descriptor for espflash compatibility
esp_bootloader_esp_idf::esp_app_desc!();

// Static cells for embassy components
static WIFI_INIT_CELL: StaticCell<esp_wifi::EspWifiController<'static>> = StaticCell::new();
static STATION_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
static PORTAL_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
static LEDC_CELL: StaticCell<Ledc<'static>> = StaticCell::new();
static SERVO_TIMER_CELL: StaticCell<timer::Timer<'static, LowSpeed>> = StaticCell::new();
static NODE_CELL: StaticCell<Node<EspPlatform>> = StaticCell::new();

// Channels between the node loop and the socket tasks
static MQTT_CHANNELS: MqttChannels = MqttChannels::new();
static PORTAL_CHANNELS: PortalChannels = PortalChannels::new();

// Static executor for embassy tasks
static EXECUTOR: StaticCell<Executor> = StaticCell::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    error!("[MAIN] Panic: {}", info);
    loop {}
}

// Embassy task to run a network stack (station and access point)
#[embassy_executor::task(pool_size = 2)]
async fn net_task(
    mut runner: embassy_net::Runner<'static, esp_wifi::wifi::WifiDevice<'static>>,
) -> ! {
    runner.run().await
}

// The node loop
#[embassy_executor::task]
async fn node_task(node: &'static mut Node<EspPlatform>) -> ! {
    info!("[STATE] Starting node loop");
    node.run().await
}

#[esp_hal::main]
fn main() -> ! {
    esp_println::logger::init_logger_from_env();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(size: 72 * 1024);

    let timer_group0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timer_group0.timer0);

    info!("[MAIN] Edge node firmware v{}", node_rs::VERSION);

    let timer_group1 = TimerGroup::new(peripherals.TIMG1);
    let mut rng = Rng::new(peripherals.RNG);
    let seed = (u64::from(rng.random()) << 32) | u64::from(rng.random());
    let wifi_init = match esp_wifi::init(timer_group1.timer0, rng, peripherals.RADIO_CLK) {
        Ok(init) => init,
        Err(_) => halt(NodeError::WiFiError, "WiFi driver init"),
    };
    let wifi_init = WIFI_INIT_CELL.init(wifi_init);

    let (wifi_controller, wifi_interfaces) = match wifi::new(wifi_init, peripherals.WIFI) {
        Ok(parts) => parts,
        Err(_) => halt(NodeError::WiFiError, "WiFi controller"),
    };
    info!("[WIFI] WiFi controller and devices created");

    // Station interface: DHCP client
    let (station_stack, station_runner) = embassy_net::new(
        wifi_interfaces.sta,
        Config::dhcpv4(Default::default()),
        STATION_RESOURCES.init(StackResources::new()),
        seed,
    );

    // Access point interface: static portal address
    let [a, b, c, d] = config::PORTAL_ADDRESS;
    let portal_ip = Ipv4Addr::new(a, b, c, d);
    let portal_config = Config::ipv4_static(StaticConfigV4 {
        address: Ipv4Cidr::new(portal_ip, 24),
        gateway: Some(portal_ip),
        dns_servers: Default::default(),
    });
    let (portal_stack, portal_runner) = embassy_net::new(
        wifi_interfaces.ap,
        portal_config,
        PORTAL_RESOURCES.init(StackResources::new()),
        seed.rotate_left(17),
    );

    // Status LED
    let rmt = match Rmt::new(peripherals.RMT, Rate::from_mhz(80)) {
        Ok(rmt) => rmt,
        Err(_) => halt(NodeError::HardwareError, "RMT init"),
    };
    let led = SmartLedsAdapter::new(rmt.channel0, peripherals.GPIO8, smart_led_buffer!(1));
    info!("[LED] Status LED on GPIO{}", config::LED_DATA_PIN);

    // Actuators
    let output_config = OutputConfig::default();
    let light = Output::new(peripherals.GPIO4, Level::Low, output_config);
    let fan = Output::new(peripherals.GPIO5, Level::Low, output_config);
    let real_model = Output::new(peripherals.GPIO6, Level::Low, output_config);
    let relays = [
        Output::new(peripherals.GPIO7, Level::Low, output_config),
        Output::new(peripherals.GPIO1, Level::Low, output_config),
        Output::new(peripherals.GPIO20, Level::Low, output_config),
        Output::new(peripherals.GPIO21, Level::Low, output_config),
    ];

    let mut ledc = Ledc::new(peripherals.LEDC);
    ledc.set_global_slow_clock(LSGlobalClkSource::APBClk);
    let ledc = LEDC_CELL.init(ledc);
    let mut servo_timer = ledc.timer::<LowSpeed>(timer::Number::Timer0);
    if servo_timer
        .configure(timer::config::Config {
            duty: timer::config::Duty::Duty14Bit,
            clock_source: timer::LSClockSource::APBClk,
            frequency: Rate::from_hz(50),
        })
        .is_err()
    {
        halt(NodeError::HardwareError, "Servo timer");
    }
    let servo_timer = SERVO_TIMER_CELL.init(servo_timer);
    let mut servo = ledc.channel(channel::Number::Channel0, peripherals.GPIO10);
    if servo
        .configure(channel::config::Config {
            timer: servo_timer,
            duty_pct: 0,
            pin_config: channel::config::PinConfig::PushPull,
        })
        .is_err()
    {
        halt(NodeError::HardwareError, "Servo channel");
    }

    // Sensors
    let mut adc_config = AdcConfig::new();
    let gas = adc_config.enable_pin(peripherals.GPIO2, Attenuation::_11dB);
    let temperature = adc_config.enable_pin(peripherals.GPIO3, Attenuation::_11dB);
    let adc = Adc::new(peripherals.ADC1, adc_config);

    let parts = Parts::<EspPlatform> {
        mac: esp_hal::efuse::Efuse::mac_address(),
        clock: EmbassyClock,
        radio: EspRadio::new(wifi_controller, station_stack),
        flash: FlashStorage::new(),
        portal: ChannelPortalLink::new(&PORTAL_CHANNELS),
        mqtt: ChannelMqttLink::new(&MQTT_CHANNELS),
        sensors: AnalogSensors::new(adc, gas, temperature),
        outputs: GpioActuators::new(light, fan, real_model, relays, servo),
        updater: OtaUnavailable,
        system: EspSystem,
        time: SntpClient::new(station_stack),
        led,
    };
    let node = NODE_CELL.init(Node::new(parts, NodeSettings::default()));

    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        info!("[MAIN] Spawning network tasks...");
        spawner.spawn(net_task(station_runner)).ok();
        spawner.spawn(net_task(portal_runner)).ok();

        info!("[MAIN] Spawning MQTT task...");
        spawner
            .spawn(mqtt_task(station_stack, &MQTT_CHANNELS))
            .ok();

        info!("[MAIN] Spawning portal tasks...");
        spawner.spawn(dhcp_task(portal_stack, portal_ip)).ok();
        spawner
            .spawn(dns_task(portal_stack, config::PORTAL_ADDRESS))
            .ok();
        spawner
            .spawn(http_task(portal_stack, &PORTAL_CHANNELS))
            .ok();

        info!("[MAIN] Spawning node task...");
        spawner.spawn(node_task(node)).ok();
    });
}
