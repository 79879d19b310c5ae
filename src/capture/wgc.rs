//! Persistent capture using the Windows Graphics Capture API.
//!
//! The capture session stays open between grabs. Windows only delivers a
//! new frame when the content changes, so a grab with nothing new returns
//! the previous frame.

use image::RgbaImage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use windows::Foundation::TypedEventHandler;
use windows::Graphics::Capture::{
    Direct3D11CaptureFrame, Direct3D11CaptureFramePool, GraphicsCaptureItem, GraphicsCaptureSession,
};
use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Graphics::DirectX::DirectXPixelFormat;
use windows::Graphics::SizeInt32;
use windows::Win32::Foundation::{HWND, POINT};
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAP_READ, D3D11_SDK_VERSION,
    D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING, D3D11CreateDevice, ID3D11Device,
    ID3D11DeviceContext, ID3D11Resource, ID3D11Texture2D,
};
use windows::Win32::Graphics::Gdi::{MONITOR_DEFAULTTOPRIMARY, MonitorFromPoint};
use windows::Win32::System::WinRT::Direct3D11::{
    CreateDirect3D11DeviceFromDXGIDevice, IDirect3DDxgiInterfaceAccess,
};
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;
use windows::core::Interface;

use super::FrameSource;
use super::bgra_to_rgba;
use super::window::{client_area, find_window_by_process};
use crate::config::CaptureTarget;
use crate::detection::RegionOfInterest;
use crate::error::CaptureError;

/// How long the first grab waits for the session to deliver a frame.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

const PIXEL_FORMAT: DirectXPixelFormat = DirectXPixelFormat::B8G8R8A8UIntNormalized;

fn failed(context: &'static str) -> impl Fn(windows::core::Error) -> CaptureError {
    move |e| CaptureError::Failed(format!("{}: {}", context, e))
}

pub struct WgcSource {
    /// Set for window targets; frames are cropped to its client area
    hwnd: Option<HWND>,
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    d3d_device: IDirect3DDevice,
    frame_pool: Direct3D11CaptureFramePool,
    session: GraphicsCaptureSession,
    pool_size: SizeInt32,
    frame_arrived: Arc<AtomicBool>,
    last_frame: Option<RgbaImage>,
}

impl WgcSource {
    pub fn open(target: &CaptureTarget) -> Result<Self, CaptureError> {
        let (item, hwnd) = match target {
            CaptureTarget::PrimaryMonitor => (create_item_for_primary_monitor()?, None),
            CaptureTarget::Window { process_name } => {
                let hwnd = find_window_by_process(process_name)?;
                (create_item_for_window(hwnd)?, Some(hwnd))
            }
        };

        let (device, context) = create_d3d11_device()?;
        let d3d_device = create_direct3d_device(&device)?;
        let size = item.Size().map_err(failed("capture item size"))?;

        let frame_pool =
            Direct3D11CaptureFramePool::CreateFreeThreaded(&d3d_device, PIXEL_FORMAT, 2, size)
                .map_err(failed("create frame pool"))?;
        let session = frame_pool
            .CreateCaptureSession(&item)
            .map_err(failed("create capture session"))?;
        // Not available before Windows 10 2004
        let _ = session.SetIsCursorCaptureEnabled(false);

        let frame_arrived = Arc::new(AtomicBool::new(false));
        let flag = frame_arrived.clone();
        frame_pool
            .FrameArrived(&TypedEventHandler::new(
                move |_pool: &Option<Direct3D11CaptureFramePool>, _| {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
            ))
            .map_err(failed("register frame handler"))?;

        session.StartCapture().map_err(failed("start capture"))?;
        info!(
            "Capture started: {} ({}x{})",
            target, size.Width, size.Height
        );

        Ok(Self {
            hwnd,
            device,
            context,
            d3d_device,
            frame_pool,
            session,
            pool_size: size,
            frame_arrived,
            last_frame: None,
        })
    }

    /// Takes the newest queued frame, releasing older ones.
    fn latest_frame(&self) -> Option<Direct3D11CaptureFrame> {
        let mut latest: Option<Direct3D11CaptureFrame> = None;
        while let Ok(frame) = self.frame_pool.TryGetNextFrame() {
            if let Some(older) = latest.replace(frame) {
                let _ = older.Close();
            }
        }
        latest
    }

    fn read_frame(&mut self, frame: &Direct3D11CaptureFrame) -> Result<RgbaImage, CaptureError> {
        let content_size = frame.ContentSize().map_err(failed("frame size"))?;
        if content_size.Width != self.pool_size.Width || content_size.Height != self.pool_size.Height
        {
            debug!(
                "Capture size changed to {}x{}",
                content_size.Width, content_size.Height
            );
            self.frame_pool
                .Recreate(&self.d3d_device, PIXEL_FORMAT, 2, content_size)
                .map_err(failed("recreate frame pool"))?;
            self.pool_size = content_size;
        }

        let surface = frame.Surface().map_err(failed("frame surface"))?;
        let access: IDirect3DDxgiInterfaceAccess =
            surface.cast().map_err(failed("surface access"))?;
        let texture: ID3D11Texture2D =
            unsafe { access.GetInterface() }.map_err(failed("surface texture"))?;

        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };

        let staging_desc = D3D11_TEXTURE2D_DESC {
            Width: desc.Width,
            Height: desc.Height,
            MipLevels: 1,
            ArraySize: 1,
            Format: desc.Format,
            SampleDesc: desc.SampleDesc,
            Usage: D3D11_USAGE_STAGING,
            BindFlags: Default::default(),
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: Default::default(),
        };
        let staging = unsafe {
            let mut staging: Option<ID3D11Texture2D> = None;
            self.device
                .CreateTexture2D(&staging_desc, None, Some(&mut staging))
                .map_err(failed("create staging texture"))?;
            staging.ok_or_else(|| CaptureError::Failed("no staging texture".to_string()))?
        };
        let staging_resource: ID3D11Resource =
            staging.cast().map_err(failed("staging resource"))?;
        let source_resource: ID3D11Resource = texture.cast().map_err(failed("frame resource"))?;

        unsafe { self.context.CopyResource(&staging_resource, &source_resource) };

        let mapped = unsafe {
            let mut mapped = Default::default();
            self.context
                .Map(&staging_resource, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(failed("map staging texture"))?;
            mapped
        };

        let crop = match self.hwnd {
            Some(hwnd) => client_area(hwnd),
            None => RegionOfInterest::new(0, 0, desc.Width, desc.Height)
                .ok_or_else(|| CaptureError::Failed("empty frame".to_string())),
        };

        let image = crop.map(|crop| {
            let src = unsafe {
                std::slice::from_raw_parts(
                    mapped.pData as *const u8,
                    (mapped.RowPitch * desc.Height) as usize,
                )
            };
            bgra_to_rgba(src, mapped.RowPitch as usize, desc.Width, desc.Height, &crop)
        });

        unsafe { self.context.Unmap(&staging_resource, 0) };
        image
    }
}

impl FrameSource for WgcSource {
    fn grab(&mut self) -> Result<RgbaImage, CaptureError> {
        if self.last_frame.is_none() {
            let start = Instant::now();
            while !self.frame_arrived.load(Ordering::SeqCst) {
                if start.elapsed() > FIRST_FRAME_TIMEOUT {
                    return Err(CaptureError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        match self.latest_frame() {
            Some(frame) => {
                let image = self.read_frame(&frame);
                let _ = frame.Close();
                let image = image?;
                self.last_frame = Some(image.clone());
                Ok(image)
            }
            None => self.last_frame.clone().ok_or(CaptureError::Timeout),
        }
    }
}

impl Drop for WgcSource {
    fn drop(&mut self) {
        let _ = self.session.Close();
        let _ = self.frame_pool.Close();
    }
}

/// Creates a Direct3D 11 device and immediate context.
fn create_d3d11_device() -> Result<(ID3D11Device, ID3D11DeviceContext), CaptureError> {
    let mut device: Option<ID3D11Device> = None;
    let mut context: Option<ID3D11DeviceContext> = None;

    unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            None,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
        .map_err(|e| CaptureError::Unavailable(format!("no Direct3D 11 device: {}", e)))?;
    }

    match (device, context) {
        (Some(device), Some(context)) => Ok((device, context)),
        _ => Err(CaptureError::Unavailable(
            "Direct3D 11 device creation returned nothing".to_string(),
        )),
    }
}

/// Wraps a D3D11 device in the WinRT device type the capture API expects.
fn create_direct3d_device(device: &ID3D11Device) -> Result<IDirect3DDevice, CaptureError> {
    let dxgi_device: windows::Win32::Graphics::Dxgi::IDXGIDevice =
        device.cast().map_err(failed("DXGI device"))?;
    let inspectable = unsafe { CreateDirect3D11DeviceFromDXGIDevice(&dxgi_device) }
        .map_err(failed("WinRT Direct3D device"))?;
    inspectable.cast().map_err(failed("IDirect3DDevice"))
}

fn capture_interop() -> Result<IGraphicsCaptureItemInterop, CaptureError> {
    let class_name = windows::core::h!("Windows.Graphics.Capture.GraphicsCaptureItem");
    unsafe { windows::Win32::System::WinRT::RoGetActivationFactory(class_name) }
        .map_err(|e| CaptureError::Unavailable(format!("graphics capture not supported: {}", e)))
}

fn create_item_for_window(hwnd: HWND) -> Result<GraphicsCaptureItem, CaptureError> {
    unsafe { capture_interop()?.CreateForWindow(hwnd) }
        .map_err(failed("create capture item for window"))
}

fn create_item_for_primary_monitor() -> Result<GraphicsCaptureItem, CaptureError> {
    let monitor = unsafe { MonitorFromPoint(POINT { x: 0, y: 0 }, MONITOR_DEFAULTTOPRIMARY) };
    if monitor.is_invalid() {
        return Err(CaptureError::TargetNotFound("no primary monitor".to_string()));
    }
    unsafe { capture_interop()?.CreateForMonitor(monitor) }
        .map_err(failed("create capture item for monitor"))
}
