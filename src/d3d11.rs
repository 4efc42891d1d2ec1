use log::{debug, warn};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_UNKNOWN, D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_9_1, D3D_FEATURE_LEVEL_9_2, D3D_FEATURE_LEVEL_9_3,
    D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_10_1, D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_CREATE_DEVICE_DEBUG, D3D11_SDK_VERSION, D3D11CreateDevice, ID3D11Device,
    ID3D11DeviceContext,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, DXGI_ERROR_NOT_FOUND, DXGI_ERROR_SDK_COMPONENT_MISSING, IDXGIAdapter, IDXGIAdapter1,
    IDXGIFactory1, IDXGIOutput1,
};
use windows::core::Interface;

/// Used To Handle DirectX Errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("No graphics adapter at index {0}")]
    AdapterNotFound(u32),
    #[error("The graphics adapter has no display output at index {0}")]
    OutputNotFound(u32),
    #[error("D3D11CreateDevice succeeded without returning a {0}")]
    MissingInterface(&'static str),
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),
}

/// Create The DXGI Factory Used To Enumerate Adapters
#[inline]
pub fn create_dxgi_factory() -> Result<IDXGIFactory1, Error> {
    Ok(unsafe { CreateDXGIFactory1::<IDXGIFactory1>()? })
}

/// Get The Adapter At `index` In DXGI Enumeration Order
#[inline]
pub fn find_adapter(factory: &IDXGIFactory1, index: u32) -> Result<IDXGIAdapter1, Error> {
    match unsafe { factory.EnumAdapters1(index) } {
        Ok(adapter) => Ok(adapter),
        Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => Err(Error::AdapterNotFound(index)),
        Err(e) => Err(Error::WindowsError(e)),
    }
}

/// Get The Output At `index` Of `adapter` As An `IDXGIOutput1`, Which Can Be Duplicated
#[inline]
pub fn find_output(adapter: &IDXGIAdapter1, index: u32) -> Result<IDXGIOutput1, Error> {
    match unsafe { adapter.EnumOutputs(index) } {
        Ok(output) => Ok(output.cast::<IDXGIOutput1>()?),
        Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => Err(Error::OutputNotFound(index)),
        Err(e) => Err(Error::WindowsError(e)),
    }
}

/// Create ID3D11Device And ID3D11DeviceContext On `adapter`
///
/// BGRA support is always requested because Direct2D draws through this device. When
/// `debug_layer` is set but the SDK layers are not installed, the device is created
/// without them.
pub fn create_d3d_device(
    adapter: &IDXGIAdapter1,
    debug_layer: bool,
) -> Result<(ID3D11Device, ID3D11DeviceContext), Error> {
    if debug_layer {
        match create_device_with_flags(adapter, true) {
            Err(Error::WindowsError(e)) if e.code() == DXGI_ERROR_SDK_COMPONENT_MISSING => {
                warn!("Direct3D debug layer is not installed, creating the device without it");
            }
            result => return result,
        }
    }

    create_device_with_flags(adapter, false)
}

fn create_device_with_flags(
    adapter: &IDXGIAdapter1,
    debug_layer: bool,
) -> Result<(ID3D11Device, ID3D11DeviceContext), Error> {
    // Set Feature Flags
    let feature_flags = [
        D3D_FEATURE_LEVEL_11_1,
        D3D_FEATURE_LEVEL_11_0,
        D3D_FEATURE_LEVEL_10_1,
        D3D_FEATURE_LEVEL_10_0,
        D3D_FEATURE_LEVEL_9_3,
        D3D_FEATURE_LEVEL_9_2,
        D3D_FEATURE_LEVEL_9_1,
    ];

    let mut flags = D3D11_CREATE_DEVICE_BGRA_SUPPORT;
    if debug_layer {
        flags |= D3D11_CREATE_DEVICE_DEBUG;
    }

    // An explicit adapter requires the unknown driver type
    let adapter = adapter.cast::<IDXGIAdapter>()?;

    let mut d3d_device = None;
    let mut feature_level = D3D_FEATURE_LEVEL::default();
    let mut d3d_device_context = None;
    unsafe {
        D3D11CreateDevice(
            &adapter,
            D3D_DRIVER_TYPE_UNKNOWN,
            HMODULE::default(),
            flags,
            Some(&feature_flags),
            D3D11_SDK_VERSION,
            Some(&mut d3d_device),
            Some(&mut feature_level),
            Some(&mut d3d_device_context),
        )?;
    };

    debug!("Created Direct3D device with feature level {:#x} (debug layer: {debug_layer})", feature_level.0);

    let d3d_device = d3d_device.ok_or(Error::MissingInterface("ID3D11Device"))?;
    let d3d_device_context = d3d_device_context.ok_or(Error::MissingInterface("ID3D11DeviceContext"))?;

    Ok((d3d_device, d3d_device_context))
}
