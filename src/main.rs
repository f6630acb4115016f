//! Locker Kiosk Controller - ESP32 firmware driving a bank of
//! electromechanical lockers over an RS-485 relay-card bus.
//!
//! Architecture: cooperative embassy tasks on the esp-rtos scheduler.
//! - `executor`: drains the durable command queue and runs hardware opens
//! - `bus`: health monitoring and reconnection for the RS-485 link
//! - `rfid`: Wiegand card scans feeding the locker state machine
//! - `sync`/`http`: dispatcher exchange and the staff surface
//! - `storage`: flash persistence of locker rows and the command queue
//!
//! All state mutations flow through the state manager (`lockers`) and the
//! command queue (`commands`); the bus controller owns the serial port
//! exclusively.

#![no_std]
#![no_main]

use esp_bootloader_esp_idf::esp_app_desc;
esp_app_desc!();

mod bus;
mod commands;
mod config;
mod events;
mod executor;
mod http;
mod lockers;
mod modbus;
mod net;
mod proto;
mod rfid;
mod shared;
mod storage;
mod sync;
mod wiegand;

extern crate alloc;

use alloc::boxed::Box;
use core::cell::RefCell;
use core::mem::MaybeUninit;

use critical_section::Mutex as CsMutex;
use embassy_executor::Spawner;
use embassy_net::{Config as NetConfig, Runner, Stack, StackResources};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::Timer;
use esp_alloc as _;
use esp_hal::{
    clock::CpuClock,
    gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull},
    main,
    rng::Rng,
    time::Duration,
    timer::timg::{TimerGroup, Wdt},
    uart::{Config as UartConfig, Uart},
};
use esp_println::logger::init_logger;
use esp_radio::wifi::{Config as WifiConfig, WifiController, WifiDevice};
use static_cell::StaticCell;

use crate::bus::BusController;
use crate::commands::CommandQueue;
use crate::config::{KioskConfig, Tuning};
use crate::events::EventBuffer;
use crate::lockers::LockerTable;
use crate::shared::{Ctx, LockerLocks};
use crate::storage::Store;
use crate::wiegand::Wiegand;

/// Event buffer shared by every transition path and the sync task.
static EVENTS: EventBuffer = EventBuffer::new();
static LOCKER_LOCKS: LockerLocks = LockerLocks::new();
static DIRTY: Signal<CriticalSectionRawMutex, ()> = Signal::new();
static SYNC_NOW: Signal<CriticalSectionRawMutex, ()> = Signal::new();

static CONFIG: StaticCell<KioskConfig> = StaticCell::new();
static LOCKERS: StaticCell<Mutex<CriticalSectionRawMutex, LockerTable>> = StaticCell::new();
static QUEUE: StaticCell<Mutex<CriticalSectionRawMutex, CommandQueue>> = StaticCell::new();
static BUS: StaticCell<BusController> = StaticCell::new();
static STACK: StaticCell<Stack<'static>> = StaticCell::new();
static RESOURCES: StaticCell<StackResources<8>> = StaticCell::new();
static EXECUTOR: StaticCell<esp_rtos::embassy::Executor> = StaticCell::new();

// Watchdog timer (TIMG1; TIMG0 drives the scheduler)
pub(crate) static WATCHDOG: CsMutex<RefCell<Option<Wdt<esp_hal::peripherals::TIMG1>>>> =
    CsMutex::new(RefCell::new(None));

/// Feed the watchdog timer. Safe to call from any task.
pub fn feed_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.feed();
        }
    });
}

#[main]
fn main() -> ! {
    init_logger(log::LevelFilter::Info);
    log::info!("Locker Kiosk Controller starting...");

    // Initialize heap (esp-radio needs it; so do the flash scratch buffers)
    const HEAP_SIZE: usize = 72 * 1024;
    static mut HEAP: MaybeUninit<[u8; HEAP_SIZE]> = MaybeUninit::uninit();
    unsafe {
        esp_alloc::HEAP.add_region(esp_alloc::HeapRegion::new(
            HEAP.as_mut_ptr() as *mut u8,
            HEAP_SIZE,
            esp_alloc::MemoryCapability::Internal.into(),
        ));
    }

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    // Scheduler first: esp-radio and the embassy time driver need it
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // Radio. Leaked to 'static so the controller and device borrows hold
    // for the life of the firmware.
    let esp_radio_ctrl = Box::leak(Box::new(esp_radio::init().unwrap()));
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(esp_radio_ctrl, peripherals.WIFI, WifiConfig::default()).unwrap();

    // Watchdog on TIMG1, 30s. Fed by the janitor task, so a wedged
    // executor side takes the whole kiosk down to a clean reboot.
    let timg1 = TimerGroup::new(peripherals.TIMG1);
    let mut wdt = timg1.wdt;
    wdt.enable();
    wdt.set_timeout(
        esp_hal::timer::timg::MwdtStage::Stage0,
        Duration::from_secs(30),
    );
    critical_section::with(|cs| {
        WATCHDOG.borrow_ref_mut(cs).replace(unsafe { core::mem::transmute(wdt) });
    });

    let config = CONFIG.init(KioskConfig::get());
    let tuning = Tuning::default();
    log::info!(
        "config: kiosk={} lockers={} cards={} host={}:{}",
        config.kiosk_id,
        config.locker_count,
        config.card_count(),
        config.server_host,
        config.server_port
    );

    let mut rng = Rng::new();

    // RS-485 bus on UART1: TX=GPIO17, RX=GPIO16, driver-enable=GPIO4
    let uart_config = UartConfig::default().with_baudrate(config.baud_rate);
    let bus_uart = Uart::new(peripherals.UART1, uart_config)
        .expect("uart init")
        .with_tx(peripherals.GPIO17)
        .with_rx(peripherals.GPIO16)
        .into_async();
    let driver_enable = Output::new(peripherals.GPIO4, Level::Low, OutputConfig::default());

    // Wiegand reader pins (GPIO14=D0, GPIO27=D1)
    let input_config = InputConfig::default().with_pull(Pull::Up);
    let reader = Wiegand::new(
        Input::new(peripherals.GPIO14, input_config),
        Input::new(peripherals.GPIO27, input_config),
    );

    let lockers = LOCKERS.init(Mutex::new(LockerTable::new(
        config.locker_count,
        config.vip_lockers,
        tuning.reserve_ttl_ms,
    )));
    let queue = QUEUE.init(Mutex::new(CommandQueue::new(
        tuning.max_retries,
        config.locker_count,
    )));
    let bus = BUS.init(BusController::new(
        bus_uart,
        driver_enable,
        tuning,
        rng,
        &EVENTS,
        config.card_count(),
    ));

    let seed = ((rng.random() as u64) << 32) | rng.random() as u64;
    let (stack, runner) = embassy_net::new(
        interfaces.sta,
        NetConfig::dhcpv4(Default::default()),
        RESOURCES.init(StackResources::new()),
        seed,
    );
    let stack = STACK.init(stack);

    let ctx = Ctx {
        lockers,
        queue,
        bus,
        events: &EVENTS,
        locks: &LOCKER_LOCKS,
        dirty: &DIRTY,
        sync_now: &SYNC_NOW,
        config,
        tuning,
        rng,
    };

    let executor = EXECUTOR.init(esp_rtos::embassy::Executor::new());
    executor.run(move |spawner| {
        spawner.must_spawn(bringup(spawner, ctx, reader, wifi_controller, runner, stack));
    })
}

/// Restore persisted state, then spawn everything. Runs once.
#[embassy_executor::task]
async fn bringup(
    spawner: Spawner,
    ctx: Ctx,
    reader: Wiegand<'static>,
    controller: WifiController<'static>,
    runner: Runner<'static, WifiDevice<'static>>,
    stack: &'static Stack<'static>,
) {
    let mut store = Store::new();
    {
        let mut lockers = ctx.lockers.lock().await;
        let mut queue = ctx.queue.lock().await;
        store.load(&mut lockers, &mut queue).await;
    }

    spawner.must_spawn(net_task(runner));
    spawner.must_spawn(wifi_task(controller, ctx.config));
    spawner.must_spawn(health_task(ctx.bus));
    spawner.must_spawn(executor_task(ctx));
    spawner.must_spawn(janitor_task(ctx));
    spawner.must_spawn(reader_task(reader, ctx));
    spawner.must_spawn(sync_task(stack, ctx));
    spawner.must_spawn(http_task(stack, ctx));
    spawner.must_spawn(persistence_task(store, ctx));
}

#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) -> ! {
    runner.run().await
}

#[embassy_executor::task]
async fn wifi_task(controller: WifiController<'static>, config: &'static KioskConfig) -> ! {
    net::maintain_wifi(controller, config).await
}

#[embassy_executor::task]
async fn health_task(bus: &'static BusController) -> ! {
    bus.run_health_monitor().await
}

#[embassy_executor::task]
async fn executor_task(ctx: Ctx) -> ! {
    executor::run_executor(ctx).await
}

#[embassy_executor::task]
async fn janitor_task(ctx: Ctx) -> ! {
    executor::run_janitor(ctx).await
}

#[embassy_executor::task]
async fn reader_task(reader: Wiegand<'static>, ctx: Ctx) -> ! {
    rfid::run_reader(reader, ctx).await
}

#[embassy_executor::task]
async fn sync_task(stack: &'static Stack<'static>, ctx: Ctx) -> ! {
    sync::run_sync(stack, ctx).await
}

#[embassy_executor::task]
async fn http_task(stack: &'static Stack<'static>, ctx: Ctx) -> ! {
    http::run_server(stack, ctx).await
}

/// Flush state to flash whenever something marks it dirty. The short delay
/// coalesces bursts of mutations into one write pass.
#[embassy_executor::task]
async fn persistence_task(mut store: Store, ctx: Ctx) -> ! {
    loop {
        ctx.dirty.wait().await;
        Timer::after_millis(250).await;

        let rows = ctx.lockers.lock().await.snapshot();
        let commands = ctx.queue.lock().await.snapshot();
        store.save(&rows, &commands).await;
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    critical_section::with(|_| {
        log::error!("PANIC: {}", info);
    });

    // Spin without feeding the watchdog; the 30s timeout resets the kiosk.
    loop {
        core::hint::spin_loop();
    }
}
