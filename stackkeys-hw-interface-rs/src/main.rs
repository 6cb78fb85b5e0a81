//! stackkeys-hw-interface
//!
//! Firmware for one StackKeys keyboard module on the Raspberry Pi Pico 2.
//! Wires the three library crates into a running instrument:
//!
//! 1. The key scan task reads the matrix every 20 ms and queues a message
//!    for every key that changed.
//! 2. The send task forwards those messages to the neighbour link, at most
//!    three in flight.
//! 3. Frames arriving on the link (and, in loopback, our own frames) land
//!    in the inbound queue; the decode task applies them and publishes a
//!    new oscillator step size.
//! 4. The audio task fills I2S DMA buffers one sample at a time from the
//!    published step size and volume.
//!
//! | Executor | Tasks |
//! |----------|-------|
//! | `EXECUTOR_HIGH` (SWI_IRQ_1, P2) | audio, link RX/TX pumps |
//! | `EXECUTOR_MED` (SWI_IRQ_0, P3) | key scan |
//! | `EXECUTOR_LOW` (SWI_IRQ_2, P4) | telemetry |
//! | thread | decode, send |
//!
//! The RP2350 has no CAN controller, so the neighbour bus is a UART. Each
//! frame (identifier, payload, CRC-8) is SLIP-delimited, so the receiver
//! drops a damaged frame and picks up again at the next delimiter. The
//! pumps call the same non-blocking handlers a bus interrupt would.

#![no_std]
#![no_main]

use defmt::*;
use embassy_executor::{InterruptExecutor, Spawner};
use embassy_rp::block::ImageDef;
use embassy_rp::gpio::{Input, Level, Output, Pull};
use embassy_rp::interrupt;
use embassy_rp::interrupt::{InterruptExt, Priority};
use embassy_rp::peripherals::{PIO0, UART0};
use embassy_rp::pio::{self, Pio};
use embassy_rp::pio_programs::i2s::{PioI2sOut, PioI2sOutProgram};
use embassy_rp::uart::{self, Uart, UartRx, UartTx};
use embassy_rp::bind_interrupts;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::Delay;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use key_matrix::layout::{DISPLAY_ENABLE_OUT, DISPLAY_RESET_OUT};
use key_matrix::KeyMatrix;
use stackkeys::link::encode;
use stackkeys::{AudioSink, BusFrame, BusTransport, LinkDecoder, LinkError, SAMPLE_RATE_HZ};
use stackkeys_tasks::{
    key_scan_task, message_decode_task, message_send_task, telemetry_task, BusInterrupts,
    BusQueues, CreditPool, KeyScanner, MessageDecoder, MessageSender, SampleGenerator,
    SharedState, SynthControls, TaskConfig, Telemetry, TX_CREDITS,
};

// ---------------------------------------------------------------------------
// Boot block and interrupt binding
// ---------------------------------------------------------------------------

/// Tell the RP2350 Boot ROM about our application.
#[link_section = ".start_block"]
#[used]
pub static IMAGE_DEF: ImageDef = embassy_rp::block::ImageDef::secure_exe();

bind_interrupts!(struct Irqs {
    PIO0_IRQ_0 => pio::InterruptHandler<PIO0>;
    UART0_IRQ => uart::InterruptHandler<UART0>;
});

static EXECUTOR_HIGH: InterruptExecutor = InterruptExecutor::new();
static EXECUTOR_MED: InterruptExecutor = InterruptExecutor::new();
static EXECUTOR_LOW: InterruptExecutor = InterruptExecutor::new();

#[interrupt]
unsafe fn SWI_IRQ_1() {
    EXECUTOR_HIGH.on_interrupt()
}

#[interrupt]
unsafe fn SWI_IRQ_0() {
    EXECUTOR_MED.on_interrupt()
}

#[interrupt]
unsafe fn SWI_IRQ_2() {
    EXECUTOR_LOW.on_interrupt()
}

// ---------------------------------------------------------------------------
// Static storage
// ---------------------------------------------------------------------------

/// Samples per DMA half-buffer: 10 ms at 22 kHz.
const AUDIO_BUFFER_LEN: usize = 220;

/// Neighbour link baud rate.
const LINK_BAUD_RATE: u32 = 115_200;

/// Keys, knobs and position, plus the synth controls and counters.
/// Initialised at start-up once the chip id is known.
static SHARED: StaticCell<SharedState> = StaticCell::new();

static QUEUES: BusQueues = BusQueues::new();
static CREDITS: CreditPool = CreditPool::new();

/// Frames accepted by the transport, waiting for the TX pump. Credits keep
/// at most `TX_CREDITS` outstanding, so this never overflows.
static LINK_TX: Channel<CriticalSectionRawMutex, BusFrame, TX_CREDITS> = Channel::new();

static AUDIO_DMA: StaticCell<[u32; AUDIO_BUFFER_LEN * 2]> = StaticCell::new();

// ---------------------------------------------------------------------------
// Type aliases and adapters
// ---------------------------------------------------------------------------

type Matrix = KeyMatrix<Output<'static>, Input<'static>, Delay>;

/// Hands frames to the TX pump without blocking.
struct LinkTransport {
    irq: BusInterrupts<'static>,
}

impl BusTransport for LinkTransport {
    fn transmit(&mut self, frame: BusFrame) {
        if LINK_TX.try_send(frame).is_err() {
            // Give the credit back so the send task cannot stall on it.
            warn!("Link TX queue full; frame dropped");
            self.irq.on_transmit_complete();
        }
    }
}

/// One DMA half-buffer being filled, sample by sample.
struct DmaFrame<'a> {
    words: core::slice::IterMut<'a, u32>,
}

impl AudioSink for DmaFrame<'_> {
    fn emit_sample(&mut self, sample: u8) {
        if let Some(word) = self.words.next() {
            let pcm = (i16::from(sample) - 128) << 8;
            // Same sample on both channels.
            *word = u32::from(pcm as u16) * 0x0001_0001;
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Fill one half of the DMA buffer while the other half plays.
#[embassy_executor::task]
async fn audio_task(
    mut i2s: PioI2sOut<'static, PIO0, 0>,
    buffer: &'static mut [u32; AUDIO_BUFFER_LEN * 2],
    controls: &'static SynthControls,
) {
    info!("Audio task started");
    let mut generator = SampleGenerator::new(controls);
    let (mut back, mut front) = buffer.split_at_mut(AUDIO_BUFFER_LEN);

    loop {
        let transfer = i2s.write(front);

        let mut frame = DmaFrame { words: back.iter_mut() };
        for _ in 0..AUDIO_BUFFER_LEN {
            generator.on_tick(&mut frame);
        }

        transfer.await;
        core::mem::swap(&mut back, &mut front);
    }
}

/// Write queued frames to the link and report each completion.
#[embassy_executor::task]
async fn link_tx_task(
    mut tx: UartTx<'static, uart::Async>,
    irq: BusInterrupts<'static>,
    loopback: bool,
) {
    loop {
        let frame = LINK_TX.receive().await;
        if let Err(e) = tx.write(encode(&frame).as_bytes()).await {
            warn!("Link write failed: {}", e);
        }
        irq.on_transmit_complete();

        if loopback {
            irq.on_frame_received(frame.id, &frame.payload);
        }
    }
}

/// Feed received bytes through the frame decoder into the inbound queue.
#[embassy_executor::task]
async fn link_rx_task(mut rx: UartRx<'static, uart::Async>, irq: BusInterrupts<'static>) {
    let mut decoder = LinkDecoder::new();
    let mut byte = [0u8; 1];
    loop {
        match rx.read(&mut byte).await {
            Ok(()) => {
                irq.on_link_byte(&mut decoder, byte[0]);
            }
            Err(e) => {
                warn!("Link read failed: {}", e);
                decoder.reset();
                irq.on_link_error(LinkError::LineFault);
            }
        }
    }
}

/// Thin wrappers that monomorphise the generic task loops so they can be
/// spawned as concrete Embassy tasks.
#[embassy_executor::task]
async fn scan_task(scanner: KeyScanner<'static, Matrix>, config: TaskConfig) {
    key_scan_task(scanner, config).await
}

#[embassy_executor::task]
async fn decode_task(decoder: MessageDecoder<'static>) {
    message_decode_task(decoder).await
}

#[embassy_executor::task]
async fn send_task(sender: MessageSender<'static, LinkTransport>) {
    message_send_task(sender).await
}

#[embassy_executor::task]
async fn status_task(telemetry: Telemetry<'static>, config: TaskConfig) {
    telemetry_task(telemetry, config).await
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());
    info!("stackkeys-hw-interface starting");

    let config = TaskConfig::default();

    // ── Pin assignments ───────────────────────────────────────────────────────
    // LINK_TX → GP0, LINK_RX → GP1        (UART0)
    // RA0..RA2 → GP2..GP4                 row address
    // REN → GP5, OUT → GP6                row enable, mux output data
    // C0..C3 → GP7..GP10                  columns, pull-up
    // I2S BCLK → GP18, LRCLK → GP19, DIN → GP20

    let device_id = match embassy_rp::otp::get_chipid() {
        Ok(id) => id as u32,
        Err(_) => {
            warn!("Could not read chip id; using 0");
            0
        }
    };
    info!("Device id {=u32:x}", device_id);

    let shared: &'static SharedState = SHARED.init(SharedState::new(device_id));

    // ── Key matrix ────────────────────────────────────────────────────────────

    let mut matrix: Matrix = KeyMatrix::new(
        [
            Output::new(p.PIN_2, Level::Low),
            Output::new(p.PIN_3, Level::Low),
            Output::new(p.PIN_4, Level::Low),
        ],
        Output::new(p.PIN_5, Level::Low),
        Output::new(p.PIN_6, Level::Low),
        [
            Input::new(p.PIN_7, Pull::Up),
            Input::new(p.PIN_8, Pull::Up),
            Input::new(p.PIN_9, Pull::Up),
            Input::new(p.PIN_10, Pull::Up),
        ],
        Delay,
    );

    // Pulse the display reset and power the panel, so it is in a known
    // state even though nothing is drawn on it.
    for (index, level) in [
        (DISPLAY_RESET_OUT, false),
        (DISPLAY_RESET_OUT, true),
        (DISPLAY_ENABLE_OUT, true),
    ] {
        if let Err(e) = matrix.write_mux_output(index, level).await {
            warn!("Mux output {} not set: {}", index, e);
        }
    }

    // ── Audio ─────────────────────────────────────────────────────────────────

    let Pio { mut common, sm0, .. } = Pio::new(p.PIO0, Irqs);
    let program = PioI2sOutProgram::new(&mut common);
    let i2s = PioI2sOut::new(
        &mut common,
        sm0,
        p.DMA_CH0,
        p.PIN_20, // DIN
        p.PIN_18, // BCLK
        p.PIN_19, // LRCLK
        SAMPLE_RATE_HZ,
        16,
        &program,
    );
    let audio_buffer = AUDIO_DMA.init([0u32; AUDIO_BUFFER_LEN * 2]);

    // ── Neighbour link ────────────────────────────────────────────────────────

    let mut uart_config = uart::Config::default();
    uart_config.baudrate = LINK_BAUD_RATE;
    let uart = Uart::new(p.UART0, p.PIN_0, p.PIN_1, Irqs, p.DMA_CH1, p.DMA_CH2, uart_config);
    let (link_tx, link_rx) = uart.split();

    let irq = BusInterrupts::new(&QUEUES.inbound, &CREDITS, shared.counters(), config.bus_id);

    // ── Spawn tasks ───────────────────────────────────────────────────────────

    interrupt::SWI_IRQ_1.set_priority(Priority::P2);
    let high = EXECUTOR_HIGH.start(interrupt::SWI_IRQ_1);
    interrupt::SWI_IRQ_0.set_priority(Priority::P3);
    let medium = EXECUTOR_MED.start(interrupt::SWI_IRQ_0);
    interrupt::SWI_IRQ_2.set_priority(Priority::P4);
    let low = EXECUTOR_LOW.start(interrupt::SWI_IRQ_2);

    high.spawn(audio_task(i2s, audio_buffer, shared.controls())).unwrap();
    high.spawn(link_tx_task(link_tx, irq, config.loopback)).unwrap();
    high.spawn(link_rx_task(link_rx, irq)).unwrap();

    let scanner = KeyScanner::new(matrix, shared, &QUEUES.outbound, &config);
    medium.spawn(scan_task(scanner, config)).unwrap();

    low.spawn(status_task(Telemetry::new(shared), config)).unwrap();

    spawner.spawn(decode_task(MessageDecoder::new(shared, &QUEUES.inbound))).unwrap();
    let transport = LinkTransport { irq };
    let sender = MessageSender::new(transport, &QUEUES.outbound, &CREDITS, config.bus_id);
    spawner.spawn(send_task(sender)).unwrap();

    info!("All tasks spawned");
}
